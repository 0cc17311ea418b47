//! Virtual address spaces.
//!
//! A [`Vm`] owns one device virtual-address range and the page tables that
//! translate it. Reserving a range ([`Vm::get`]) allocates virtual space
//! first-fit and materializes every page table the range touches, with a
//! per-table reference count so adjacent reservations share tables.
//! Releasing the reservation drops the references and frees tables whose
//! count reaches zero.
//!
//! Lifetime is structural: a [`Vma`] holds a clone of its `Vm`, and the
//! space's own teardown runs when the last handle drops. Double release is
//! unrepresentable; both `Vma` and the page-table blocks move on release.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::btree_map::Entry;
use alloc::sync::Arc;
use core::fmt;

use gpuvm_addresses::{DeviceAddress, PhysicalAddress};
use gpuvm_sync::SpinLock;

use crate::cache::{Mmu, PtBlock};
use crate::layout::{PagingLayout, TableDesc};
use crate::memory::{MemoryObject, Tags};
use crate::mm::RangeAllocator;
use crate::{Access, GRANULE_SHIFT, MmuError, Result};

/// Integration hooks invoked at address-space attach and teardown points.
///
/// All methods have do-nothing defaults; integrations override what they
/// need (typically writing the root-table address into channel instance
/// memory on `join`).
pub trait VmHooks: Send + Sync {
    /// A client instance is attaching to the space. Failing aborts the
    /// attach and leaves the previous binding in place.
    ///
    /// # Errors
    /// Implementation-defined; propagated to [`Vm::replace`].
    fn join(&self, root: Option<PhysicalAddress>, inst: &MemoryObject) -> Result<()> {
        let _ = (root, inst);
        Ok(())
    }

    /// A client instance detached from the space.
    fn part(&self, inst: &MemoryObject) {
        let _ = inst;
    }

    /// The last handle to the space dropped and its tables are gone.
    fn teardown(&self) {}
}

pub(crate) struct PgtSlot {
    pub(crate) pt: PtBlock,
    refs: u64,
}

pub(crate) struct VmState {
    /// Virtual-range allocator in granule-page units.
    mm: RangeAllocator,
    /// Live page tables, keyed by page-size class and directory index.
    pub(crate) pgt: BTreeMap<(usize, u64), PgtSlot>,
    pub(crate) root: Option<PtBlock>,
}

pub(crate) struct VmInner {
    pub(crate) mmu: Arc<Mmu>,
    pub(crate) layout: PagingLayout,
    hooks: Option<Box<dyn VmHooks>>,
    start: u64,
    limit: u64,
    pub(crate) state: SpinLock<VmState>,
}

/// Shared handle to a virtual address space.
#[derive(Clone)]
pub struct Vm {
    pub(crate) inner: Arc<VmInner>,
}

impl Vm {
    /// Create a space covering `[start, limit)` with no hooks.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] if the layout requires a root table and
    /// its backing allocation fails.
    pub fn new(mmu: &Arc<Mmu>, start: u64, limit: u64, layout: PagingLayout) -> Result<Self> {
        Self::with_hooks(mmu, start, limit, layout, None)
    }

    /// Create a space with integration hooks attached.
    ///
    /// # Errors
    /// Same as [`Vm::new`].
    pub fn with_hooks(
        mmu: &Arc<Mmu>,
        start: u64,
        limit: u64,
        layout: PagingLayout,
        hooks: Option<Box<dyn VmHooks>>,
    ) -> Result<Self> {
        debug_assert!(start < limit);
        debug_assert!(start.trailing_zeros() >= GRANULE_SHIFT || start == 0);
        debug_assert!(limit.trailing_zeros() >= GRANULE_SHIFT);

        let root = match layout.root {
            Some(desc) => Some(mmu.pt_get(desc.size, desc.align, true)?),
            None => None,
        };
        log::debug!(
            "new {:?} address space [{start:#x}, {limit:#x})",
            layout.generation
        );

        Ok(Self {
            inner: Arc::new(VmInner {
                mmu: Arc::clone(mmu),
                layout,
                hooks,
                start,
                limit,
                state: SpinLock::new(VmState {
                    mm: RangeAllocator::new(
                        start >> GRANULE_SHIFT,
                        (limit - start) >> GRANULE_SHIFT,
                    ),
                    pgt: BTreeMap::new(),
                    root,
                }),
            }),
        })
    }

    /// Device-visible address of the root table, if the layout has one.
    #[must_use]
    pub fn root_addr(&self) -> Option<PhysicalAddress> {
        self.inner.state.lock().root.as_ref().map(PtBlock::addr)
    }

    /// Reserve `size` bytes of virtual space for pages of `page_shift`,
    /// materializing the page tables the range touches.
    ///
    /// The reservation starts unmapped. On any failure the space is left
    /// exactly as before the call.
    ///
    /// # Errors
    /// - [`MmuError::UnsupportedConfiguration`] if the layout has no page
    ///   class at `page_shift`.
    /// - [`MmuError::NoSpace`] if the virtual range is exhausted.
    /// - [`MmuError::OutOfMemory`] if a page-table allocation fails.
    pub fn get(&self, size: u64, page_shift: u32, access: Access) -> Result<Vma> {
        let inner = &self.inner;
        let (page_index, desc) =
            inner
                .layout
                .page(page_shift)
                .ok_or(MmuError::UnsupportedConfiguration {
                    generation: inner.layout.generation,
                    shift: page_shift,
                })?;
        debug_assert!(size > 0 && size % (1 << page_shift) == 0);

        let pages = size >> GRANULE_SHIFT;
        let align = 1 << (page_shift - GRANULE_SHIFT);

        let mut state = inner.state.lock();
        let addr = state.mm.alloc(pages, align)? << GRANULE_SHIFT;

        if let Some(table) = desc.table {
            if let Err(error) = inner.pgt_get(&mut state, page_index, table, page_shift, addr, size)
            {
                state.mm.free(addr >> GRANULE_SHIFT, pages);
                return Err(error);
            }
        }
        drop(state);

        Ok(Vma {
            vm: self.clone(),
            addr,
            size,
            page_index,
            page_shift,
            access,
            memory: None,
            tags: None,
        })
    }

    /// Release a reservation. Equivalent to dropping it; the explicit form
    /// reads better at call sites that pair it with [`Vm::get`].
    pub fn put(vma: Vma) {
        drop(vma);
    }

    /// Rebind `slot` to `new`, running the attach/detach hooks.
    ///
    /// With `inst` present, the incoming space's `join` hook runs first
    /// and may abort the rebind; the outgoing space's `part` hook runs
    /// after. Passing `None` for `new` just unbinds.
    ///
    /// # Errors
    /// Whatever the incoming `join` hook returns; `slot` is untouched then.
    pub fn replace(slot: &mut Option<Vm>, new: Option<&Vm>, inst: Option<&MemoryObject>) -> Result<()> {
        if let (Some(vm), Some(inst)) = (new, inst) {
            let root = vm.root_addr();
            if let Some(hooks) = &vm.inner.hooks {
                hooks.join(root, inst)?;
            }
        }
        if let (Some(old), Some(inst)) = (slot.as_ref(), inst) {
            if let Some(hooks) = &old.inner.hooks {
                hooks.part(inst);
            }
        }
        *slot = new.cloned();
        Ok(())
    }

    /// Managed range, `[start, limit)`.
    #[must_use]
    pub fn range(&self) -> (u64, u64) {
        (self.inner.start, self.inner.limit)
    }
}

impl VmInner {
    /// Reference (creating as needed) every page table of class
    /// `page_index` touched by `[addr, addr + size)`.
    ///
    /// On failure every reference taken by this call is rolled back.
    fn pgt_get(
        &self,
        state: &mut VmState,
        page_index: usize,
        table: TableDesc,
        page_shift: u32,
        addr: u64,
        size: u64,
    ) -> Result<()> {
        let first = addr >> table.span_shift;
        let last = (addr + size - 1) >> table.span_shift;
        for pde in first..=last {
            let refs = span_refs(table, page_shift, addr, size, pde);
            match state.pgt.entry((page_index, pde)) {
                Entry::Occupied(mut occupied) => occupied.get_mut().refs += refs,
                Entry::Vacant(vacant) => match self.mmu.pt_get(table.size, table.align, true) {
                    Ok(pt) => {
                        vacant.insert(PgtSlot { pt, refs });
                    }
                    Err(error) => {
                        if pde > first {
                            let done = (pde << table.span_shift) - addr;
                            self.pgt_put(state, page_index, table, page_shift, addr, done);
                        }
                        return Err(error);
                    }
                },
            }
        }
        Ok(())
    }

    /// Drop references on the tables covering `[addr, addr + size)`,
    /// returning fully-unreferenced tables to the cache.
    pub(crate) fn pgt_put(
        &self,
        state: &mut VmState,
        page_index: usize,
        table: TableDesc,
        page_shift: u32,
        addr: u64,
        size: u64,
    ) {
        let first = addr >> table.span_shift;
        let last = (addr + size - 1) >> table.span_shift;
        for pde in first..=last {
            let refs = span_refs(table, page_shift, addr, size, pde);
            let empty = match state.pgt.get_mut(&(page_index, pde)) {
                Some(slot) => {
                    debug_assert!(slot.refs >= refs);
                    slot.refs -= refs;
                    slot.refs == 0
                }
                None => {
                    debug_assert!(false, "releasing references on an absent page table");
                    false
                }
            };
            if empty {
                if let Some(slot) = state.pgt.remove(&(page_index, pde)) {
                    self.mmu.pt_put(slot.pt, false);
                }
            }
        }
    }
}

impl Drop for VmInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        // Reservations hold a clone of the space, so none can be left.
        debug_assert!(state.pgt.is_empty());
        debug_assert!(state.mm.is_idle());
        while let Some((_, slot)) = state.pgt.pop_first() {
            self.mmu.pt_put(slot.pt, false);
        }
        if let Some(root) = state.root.take() {
            self.mmu.pt_put(root, false);
        }
        if let Some(hooks) = &self.hooks {
            hooks.teardown();
        }
        log::debug!(
            "address space [{:#x}, {:#x}) torn down",
            self.start,
            self.limit
        );
    }
}

/// Pages of `page_shift` covered by the directory span `pde`, clipped to
/// `[addr, addr + size)`.
fn span_refs(table: TableDesc, page_shift: u32, addr: u64, size: u64, pde: u64) -> u64 {
    let span_start = pde << table.span_shift;
    let span_end = span_start + (1 << table.span_shift);
    let lo = addr.max(span_start);
    let hi = (addr + size).min(span_end);
    (hi - lo) >> page_shift
}

/// One reserved virtual-address range.
///
/// Dropping the reservation unmaps nothing by itself; entries written via
/// [`map`](Vma::map) are zeroed first because the backing tables are
/// released for reuse. Callers that need precise fault timing should
/// [`unmap`](Vma::unmap) explicitly.
pub struct Vma {
    pub(crate) vm: Vm,
    pub(crate) addr: u64,
    pub(crate) size: u64,
    pub(crate) page_index: usize,
    pub(crate) page_shift: u32,
    pub(crate) access: Access,
    pub(crate) memory: Option<MemoryObject>,
    pub(crate) tags: Option<Tags>,
}

impl Vma {
    /// Start of the reserved range.
    #[must_use]
    pub fn addr(&self) -> DeviceAddress {
        DeviceAddress::new(self.addr)
    }

    /// Reserved length in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// log2 page size of the reservation.
    #[must_use]
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Raw entry for the `page`-th page of the reservation, or `None` for
    /// flat layouts. Meant for diagnostics and tests.
    #[must_use]
    pub fn probe(&self, page: u64) -> Option<u64> {
        let inner = &self.vm.inner;
        let table = inner.layout.page_at(self.page_index).table?;
        let vaddr = self.addr + (page << self.page_shift);
        debug_assert!(vaddr < self.addr + self.size);

        let pde = vaddr >> table.span_shift;
        let state = inner.state.lock();
        let slot = state.pgt.get(&(self.page_index, pde))?;
        let ei = (vaddr >> self.page_shift) & (table.entries(self.page_shift) - 1);
        Some(slot.pt.read_entry(ei as u32))
    }
}

impl fmt::Debug for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vma")
            .field("addr", &self.addr())
            .field("size", &self.size)
            .field("page_shift", &self.page_shift)
            .field("access", &self.access)
            .field("mapped", &self.memory.is_some())
            .finish()
    }
}

impl Drop for Vma {
    fn drop(&mut self) {
        if self.memory.is_some() {
            self.unmap();
        }
        let inner = Arc::clone(&self.vm.inner);
        let desc = inner.layout.page_at(self.page_index);
        let mut state = inner.state.lock();
        if let Some(table) = desc.table {
            inner.pgt_put(
                &mut state,
                self.page_index,
                table,
                self.page_shift,
                self.addr,
                self.size,
            );
        }
        state
            .mm
            .free(self.addr >> GRANULE_SHIFT, self.size >> GRANULE_SHIFT);
    }
}
