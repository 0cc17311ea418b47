//! End-to-end tests driving address spaces, the block cache, and the
//! mapping engine together through a heap-backed table store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use gpuvm::pte::{LegacyPte, UnifiedPte};
use gpuvm::store::{SystemStore, TableMemory, TableStore};
use gpuvm::{
    Access, MemoryObject, MemoryTarget, MemoryType, Mmu, MmuError, PagingLayout, SgFragment, Vm,
    VmHooks,
};
use gpuvm_addresses::PhysicalAddress;

fn mmu() -> Arc<Mmu> {
    Arc::new(Mmu::new(Arc::new(SystemStore::new())))
}

fn vram(addr: u64, size: u64) -> MemoryObject {
    MemoryObject::contiguous(
        MemoryTarget::Vram,
        PhysicalAddress::new(addr),
        size,
        MemoryType::LINEAR,
    )
}

#[test]
fn reserve_map_unmap_release_cycle() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 30, PagingLayout::gen2()).unwrap();

    let mut vma = vm.get(0x2000, 12, Access::RW).unwrap();
    let base = vma.addr().as_u64();
    assert!(vma.addr().is_aligned(12));
    assert_eq!(vma.size(), 0x2000);

    vma.map(&vram(0x4000_0000, 0x2000)).unwrap();
    for page in 0..2_u64 {
        let pte = UnifiedPte::from_bits(vma.probe(page).unwrap());
        assert!(pte.valid());
        assert!(!pte.ro());
        assert!(!pte.privileged());
        assert!(!pte.vol());
        assert_eq!(pte.page() << 12, 0x4000_0000 + page * 0x1000);
    }

    vma.unmap();
    assert_eq!(vma.probe(0), Some(0));
    assert_eq!(vma.probe(1), Some(0));
    Vm::put(vma);

    // First-fit hands the same window out again.
    let again = vm.get(0x2000, 12, Access::RW).unwrap();
    assert_eq!(again.addr().as_u64(), base);
}

#[test]
fn access_and_target_shape_the_entries() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen2()).unwrap();

    let mut ro = vm.get(0x1000, 12, Access::READ).unwrap();
    ro.map(&MemoryObject::contiguous(
        MemoryTarget::HostCoherent,
        PhysicalAddress::new(0x7000),
        0x1000,
        MemoryType { kind: 0x06, comp: 0 },
    ))
    .unwrap();
    let pte = UnifiedPte::from_bits(ro.probe(0).unwrap());
    assert!(pte.ro());
    assert!(pte.vol());
    assert_eq!(pte.kind(), 0x06);

    let mut privileged = vm.get(0x1000, 12, Access::RW | Access::SYSTEM).unwrap();
    privileged.map(&vram(0x9000, 0x1000)).unwrap();
    let pte = UnifiedPte::from_bits(privileged.probe(0).unwrap());
    assert!(!pte.ro());
    assert!(pte.privileged());
    assert!(!pte.vol());
}

#[test]
fn large_pages_step_by_page_size() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 30, PagingLayout::gen2()).unwrap();

    let mut vma = vm.get(4 << 20, 21, Access::RW).unwrap();
    assert!(vma.addr().is_aligned(21));
    vma.map(&vram(0x8000_0000, 4 << 20)).unwrap();

    let first = UnifiedPte::from_bits(vma.probe(0).unwrap());
    let second = UnifiedPte::from_bits(vma.probe(1).unwrap());
    assert_eq!(first.page() << 12, 0x8000_0000);
    assert_eq!(second.page() << 12, 0x8000_0000 + (2 << 20));
}

#[test]
fn sg_table_fragments_map_in_order() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen2()).unwrap();

    let memory = MemoryObject::sg_table(
        MemoryTarget::HostCoherent,
        vec![
            SgFragment {
                addr: PhysicalAddress::new(0x1000_0000),
                length: 0x2000,
            },
            SgFragment {
                addr: PhysicalAddress::new(0x2000_0000),
                length: 0x1000,
            },
        ],
        MemoryType::LINEAR,
    );
    let mut vma = vm.get(0x3000, 12, Access::RW).unwrap();
    vma.map(&memory).unwrap();

    let pages: Vec<u64> = (0..3)
        .map(|page| UnifiedPte::from_bits(vma.probe(page).unwrap()).page() << 12)
        .collect();
    assert_eq!(pages, vec![0x1000_0000, 0x1000_1000, 0x2000_0000]);
    assert!(UnifiedPte::from_bits(vma.probe(0).unwrap()).vol());
}

#[test]
fn sg_list_maps_one_entry_per_page() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen2()).unwrap();

    let memory = MemoryObject::sg_list(
        MemoryTarget::HostNonCoherent,
        vec![
            PhysicalAddress::new(0x5000),
            PhysicalAddress::new(0x3000),
            PhysicalAddress::new(0x9000),
        ],
        MemoryType::LINEAR,
    );
    let mut vma = vm.get(0x3000, 12, Access::RW).unwrap();
    vma.map(&memory).unwrap();

    let pages: Vec<u64> = (0..3)
        .map(|page| UnifiedPte::from_bits(vma.probe(page).unwrap()).page() << 12)
        .collect();
    assert_eq!(pages, vec![0x5000, 0x3000, 0x9000]);
}

#[test]
fn partial_map_and_unmap_touch_only_their_window() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen2()).unwrap();

    let mut vma = vm.get(0x4000, 12, Access::RW).unwrap();
    vma.map_at(0x2000, &vram(0x6000_0000, 0x2000)).unwrap();
    assert_eq!(vma.probe(0), Some(0));
    assert_eq!(vma.probe(1), Some(0));
    assert!(UnifiedPte::from_bits(vma.probe(2).unwrap()).valid());
    assert!(UnifiedPte::from_bits(vma.probe(3).unwrap()).valid());

    vma.unmap_range(0x2000, 0x1000);
    assert_eq!(vma.probe(2), Some(0));
    assert!(UnifiedPte::from_bits(vma.probe(3).unwrap()).valid());
}

#[test]
fn adjacent_reservations_share_directory_tables() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen2()).unwrap();
    // Root table only.
    assert_eq!(mmu.stats().live, 1);

    let a = vm.get(0x1000, 12, Access::RW).unwrap();
    assert_eq!(mmu.stats().live, 2);
    let b = vm.get(0x1000, 12, Access::RW).unwrap();
    // Both land in the same 2 MiB span and share one table.
    assert_eq!(mmu.stats().live, 2);

    Vm::put(a);
    assert_eq!(mmu.stats().live, 2);
    Vm::put(b);
    assert_eq!(mmu.stats().live, 1);
}

#[test]
fn sub_granule_tables_come_from_a_shared_pool() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen4()).unwrap();

    let mut vma = vm.get(0x2_0000, 16, Access::RW).unwrap();
    assert_eq!(mmu.stats().pools, 1);

    vma.map(&vram(0xA000_0000, 0x2_0000)).unwrap();
    let first = UnifiedPte::from_bits(vma.probe(0).unwrap());
    let second = UnifiedPte::from_bits(vma.probe(1).unwrap());
    assert_eq!(first.page() << 12, 0xA000_0000);
    assert_eq!(second.page() << 12, 0xA000_0000 + 0x1_0000);

    Vm::put(vma);
    // The slot went back and the fully-idle parent left the pool table.
    assert_eq!(mmu.stats().pools, 0);
}

#[test]
fn legacy_entries_carry_compression_inline() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen1()).unwrap();

    let memory = MemoryObject::contiguous(
        MemoryTarget::Vram,
        PhysicalAddress::new(0x4000_0000),
        0x2000,
        MemoryType { kind: 0x12, comp: 2 },
    );
    let mut vma = vm.get(0x2000, 12, Access::RW).unwrap();
    vma.map(&memory).unwrap();

    let first = LegacyPte::from_bits(vma.probe(0).unwrap());
    let second = LegacyPte::from_bits(vma.probe(1).unwrap());
    assert!(first.valid());
    assert_eq!(first.comp(), 2);
    assert_eq!(first.kind(), 0x12);
    assert_eq!(u64::from(second.tag()), u64::from(first.tag()) + 1);

    // The same object maps with the same tag range elsewhere.
    let mut other = vm.get(0x2000, 12, Access::READ).unwrap();
    other.map(&memory).unwrap();
    let shared = LegacyPte::from_bits(other.probe(0).unwrap());
    assert_eq!(shared.tag(), first.tag());
    assert!(shared.ro());
}

#[test]
fn tag_exhaustion_degrades_to_uncompressed() {
    let store: Arc<dyn TableStore> = Arc::new(SystemStore::new());
    let mmu = Arc::new(Mmu::with_config(
        store,
        gpuvm::MmuConfig {
            idle_cap: 8,
            tag_space: 1,
        },
    ));
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen1()).unwrap();

    let memory = MemoryObject::contiguous(
        MemoryTarget::Vram,
        PhysicalAddress::new(0x4000_0000),
        0x2000,
        MemoryType { kind: 0, comp: 1 },
    );
    let mut vma = vm.get(0x2000, 12, Access::RW).unwrap();
    vma.map(&memory).unwrap();

    let pte = LegacyPte::from_bits(vma.probe(0).unwrap());
    assert!(pte.valid());
    assert_eq!(pte.comp(), 0);
    assert_eq!(pte.tag(), 0);
}

#[test]
fn tag_bases_beyond_the_entry_field_map_uncompressed() {
    // A tag space wider than the entry's 12-bit field: ranges starting
    // past the field must degrade instead of failing to encode.
    let mmu = Arc::new(Mmu::with_config(
        Arc::new(SystemStore::new()),
        gpuvm::MmuConfig {
            idle_cap: 8,
            tag_space: 1 << 16,
        },
    ));
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen1()).unwrap();

    // Pin the first 4096 tags so the next range starts out of field range.
    let filler = MemoryObject::contiguous(
        MemoryTarget::Vram,
        PhysicalAddress::new(0x1000_0000),
        1 << 24,
        MemoryType { kind: 0, comp: 1 },
    );
    let _held = mmu.tags_get(&filler, 1 << 12).unwrap().unwrap();

    let memory = MemoryObject::contiguous(
        MemoryTarget::Vram,
        PhysicalAddress::new(0x4000_0000),
        0x2000,
        MemoryType { kind: 0, comp: 1 },
    );
    let mut vma = vm.get(0x2000, 12, Access::RW).unwrap();
    vma.map(&memory).unwrap();

    for page in 0..2 {
        let pte = LegacyPte::from_bits(vma.probe(page).unwrap());
        assert!(pte.valid());
        assert_eq!(pte.comp(), 0);
        assert_eq!(pte.tag(), 0);
    }
}

#[test]
fn legacy_large_pages_are_rejected_before_any_write() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 24, PagingLayout::gen1()).unwrap();

    let mut vma = vm.get(0x1_0000, 16, Access::RW).unwrap();
    let result = vma.map(&vram(0x4000_0000, 0x1_0000));
    assert_eq!(
        result,
        Err(MmuError::UnsupportedConfiguration {
            generation: gpuvm::Generation::Gen1,
            shift: 16,
        })
    );
    assert_eq!(vma.probe(0), Some(0));

    // A page size the layout does not know at all fails at reservation.
    assert!(matches!(
        vm.get(0x1000, 21, Access::RW),
        Err(MmuError::UnsupportedConfiguration { shift: 21, .. })
    ));
}

#[test]
fn flat_layouts_reserve_without_tables() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0x1000, 0x10_0000, PagingLayout::flat()).unwrap();
    assert!(vm.root_addr().is_none());
    assert_eq!(mmu.stats().live, 0);

    let mut vma = vm.get(0x4000, 12, Access::RW).unwrap();
    assert_eq!(vma.addr().as_u64(), 0x1000);
    assert!(vma.probe(0).is_none());
    vma.map(&vram(0x2000_0000, 0x4000)).unwrap();
    vma.unmap();
    Vm::put(vma);
    assert_eq!(mmu.stats().live, 0);
}

struct FailingStore {
    inner: SystemStore,
    allowed: AtomicUsize,
}

impl TableStore for FailingStore {
    fn allocate(&self, size: u32, align: u32, zero: bool) -> gpuvm::Result<Arc<dyn TableMemory>> {
        let granted = self
            .allowed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if granted {
            self.inner.allocate(size, align, zero)
        } else {
            Err(MmuError::OutOfMemory)
        }
    }
}

#[test]
fn failed_reservation_rolls_back_completely() {
    let store = Arc::new(FailingStore {
        inner: SystemStore::new(),
        // Root plus one page table; the second table allocation fails.
        allowed: AtomicUsize::new(2),
    });
    let mmu = Arc::new(Mmu::new(Arc::clone(&store) as Arc<dyn TableStore>));
    let vm = Vm::new(&mmu, 0, 1 << 30, PagingLayout::gen2()).unwrap();

    // 4 MiB of small pages crosses two directory spans, so two tables.
    assert_eq!(vm.get(4 << 20, 12, Access::RW).unwrap_err(), MmuError::OutOfMemory);

    // The first span's table was released again; only the root is live.
    assert_eq!(mmu.stats().live, 1);
    assert_eq!(mmu.stats().idle, 1);

    // The virtual range is whole again: the next fit starts at the base.
    store.allowed.store(8, Ordering::Relaxed);
    let vma = vm.get(0x1000, 12, Access::RW).unwrap();
    assert_eq!(vma.addr().as_u64(), 0);

    let shown = format!("{vma:?}");
    assert!(shown.starts_with("Vma"));
    assert!(shown.contains("mapped: false"));
}

struct RecordingHooks {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    fail_join: bool,
}

impl VmHooks for RecordingHooks {
    fn join(&self, root: Option<PhysicalAddress>, _inst: &MemoryObject) -> gpuvm::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} join root={}", self.name, root.is_some()));
        if self.fail_join {
            return Err(MmuError::OutOfMemory);
        }
        Ok(())
    }

    fn part(&self, _inst: &MemoryObject) {
        self.log.lock().unwrap().push(format!("{} part", self.name));
    }

    fn teardown(&self) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} teardown", self.name));
    }
}

fn hooked_vm(
    mmu: &Arc<Mmu>,
    name: &'static str,
    log: &Arc<Mutex<Vec<String>>>,
    fail_join: bool,
) -> Vm {
    Vm::with_hooks(
        mmu,
        0,
        1 << 24,
        PagingLayout::gen2(),
        Some(Box::new(RecordingHooks {
            name,
            log: Arc::clone(log),
            fail_join,
        })),
    )
    .unwrap()
}

#[test]
fn rebinding_runs_join_before_part() {
    let mmu = mmu();
    let log = Arc::new(Mutex::new(Vec::new()));
    let first = hooked_vm(&mmu, "first", &log, false);
    let second = hooked_vm(&mmu, "second", &log, false);
    let inst = MemoryObject::contiguous(
        MemoryTarget::Instance,
        PhysicalAddress::new(0x1000),
        0x1000,
        MemoryType::LINEAR,
    );

    let mut bound = None;
    Vm::replace(&mut bound, Some(&first), Some(&inst)).unwrap();
    Vm::replace(&mut bound, Some(&second), Some(&inst)).unwrap();
    Vm::replace(&mut bound, None, Some(&inst)).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "first join root=true",
            "second join root=true",
            "first part",
            "second part",
        ]
    );
}

#[test]
fn failed_join_leaves_the_binding_untouched() {
    let mmu = mmu();
    let log = Arc::new(Mutex::new(Vec::new()));
    let good = hooked_vm(&mmu, "good", &log, false);
    let bad = hooked_vm(&mmu, "bad", &log, true);
    let inst = MemoryObject::contiguous(
        MemoryTarget::Instance,
        PhysicalAddress::new(0x1000),
        0x1000,
        MemoryType::LINEAR,
    );

    let mut bound = None;
    Vm::replace(&mut bound, Some(&good), Some(&inst)).unwrap();
    let root = bound.as_ref().unwrap().root_addr();

    let result = Vm::replace(&mut bound, Some(&bad), Some(&inst));
    assert_eq!(result, Err(MmuError::OutOfMemory));
    assert_eq!(bound.as_ref().unwrap().root_addr(), root);
    assert!(!log.lock().unwrap().iter().any(|line| line.as_str() == "good part"));
}

#[test]
fn teardown_runs_exactly_once_across_threads() {
    let mmu = mmu();
    let teardowns = Arc::new(AtomicUsize::new(0));

    struct CountingHooks(Arc<AtomicUsize>);
    impl VmHooks for CountingHooks {
        fn teardown(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let vm = Vm::with_hooks(
        &mmu,
        0,
        1 << 24,
        PagingLayout::gen2(),
        Some(Box::new(CountingHooks(Arc::clone(&teardowns)))),
    )
    .unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let vm = vm.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                drop(vm);
            })
        })
        .collect();
    drop(vm);
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_reservations_do_not_collide() {
    let mmu = mmu();
    let vm = Vm::new(&mmu, 0, 1 << 28, PagingLayout::gen2()).unwrap();

    let handles: Vec<_> = (0..4_u64)
        .map(|worker| {
            let vm = vm.clone();
            thread::spawn(move || {
                let mut addrs = Vec::new();
                for round in 0..50_u64 {
                    let mut vma = vm.get(0x2000, 12, Access::RW).unwrap();
                    vma.map(&vram(0x1000_0000 + worker * 0x10_0000 + round * 0x2000, 0x2000))
                        .unwrap();
                    addrs.push(vma.addr().as_u64());
                    vma.unmap();
                    Vm::put(vma);
                }
                addrs
            })
        })
        .collect();

    for handle in handles {
        // Every reservation was granule-aligned and inside the space.
        for addr in handle.join().unwrap() {
            assert_eq!(addr % 0x1000, 0);
            assert!(addr < 1 << 28);
        }
    }
    assert_eq!(mmu.stats().live, 1);
}
