//! Page-table block cache.
//!
//! Page tables are allocated and freed at high rates while address spaces
//! come and go, so freed blocks are parked on per-size idle lists instead
//! of being returned to the [`TableStore`] immediately. Blocks smaller
//! than the allocation granule are carved out of shared granule-sized
//! parents by a slot pool; a parent goes back to its idle list once every
//! slot is free again.
//!
//! The cache also owns the device-wide compression-tag space, because tag
//! ranges have the same lifetime discipline as page tables: attached on
//! map, released when the last user drops.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use gpuvm_addresses::PhysicalAddress;
use gpuvm_sync::SpinLock;

use crate::memory::{MemoryObject, TagEntry, Tags};
use crate::mm::RangeAllocator;
use crate::store::{TableMemory, TableStore};
use crate::{GRANULE, MmuError, Result};

/// Tuning knobs for [`Mmu`].
#[derive(Copy, Clone, Debug)]
pub struct MmuConfig {
    /// Idle blocks kept per size class; further returns free immediately.
    pub idle_cap: usize,
    /// Total compression tags on the device. Indices must fit the entry
    /// layouts' 12-bit tag field; ranges past it map uncompressed.
    pub tag_space: u64,
}

impl Default for MmuConfig {
    fn default() -> Self {
        // Heuristic cap; the tag space matches the entry field width.
        Self {
            idle_cap: 8,
            tag_space: 1 << 12,
        }
    }
}

enum PtOwner {
    /// Full allocation from the store, parked on an idle list when freed.
    Class,
    /// Slot carved out of a shared parent; `pool` is the pool id.
    Pool { pool: u64, shift: u32 },
}

/// One page-table backing block, owned by exactly one holder.
///
/// Ownership is by move: the block is handed out by [`Mmu::pt_get`] and
/// consumed by [`Mmu::pt_put`], so a double release does not typecheck.
pub struct PtBlock {
    memory: Arc<dyn TableMemory>,
    addr: PhysicalAddress,
    /// Byte offset of this block within `memory` (non-zero for pool slots).
    base: u32,
    size: u32,
    owner: PtOwner,
}

impl PtBlock {
    /// Device-visible address of the block.
    #[must_use]
    pub fn addr(&self) -> PhysicalAddress {
        self.addr
    }

    /// Block size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Read the 64-bit entry at `index`.
    #[must_use]
    pub fn read_entry(&self, index: u32) -> u64 {
        debug_assert!(index * 8 < self.size);
        self.memory.rd64(self.base + index * 8)
    }

    /// Write the 64-bit entry at `index`.
    pub fn write_entry(&self, index: u32, value: u64) {
        debug_assert!(index * 8 < self.size);
        self.memory.wr64(self.base + index * 8, value);
    }

    /// Fill `count` entries starting at `first`.
    pub fn fill_entries(&self, first: u32, value: u64, count: u32) {
        debug_assert!((first + count) * 8 <= self.size);
        self.memory.fill(self.base + first * 8, value, count);
    }

    fn zero_all(&self) {
        self.fill_entries(0, 0, self.size / 8);
    }
}

struct SizeClass {
    size: u32,
    idle: Vec<PtBlock>,
}

struct PtPool {
    id: u64,
    parent: PtBlock,
    shift: u32,
    /// Bitmask with one bit per slot; `free == mask` means fully idle.
    mask: u32,
    free: u32,
}

struct PoolTable {
    pools: Vec<PtPool>,
    next_id: u64,
}

/// Counters reported by [`Mmu::stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Blocks parked on idle lists.
    pub idle: usize,
    /// Blocks currently handed out.
    pub live: usize,
    /// Active slot pools.
    pub pools: usize,
}

/// The page-table block cache and tag-space owner.
///
/// One `Mmu` is shared (via `Arc`) by every address space on a device.
/// Lock order where both are taken: pools before classes.
pub struct Mmu {
    store: Arc<dyn TableStore>,
    config: MmuConfig,
    classes: SpinLock<Vec<SizeClass>>,
    pools: SpinLock<PoolTable>,
    tag_space: Arc<SpinLock<RangeAllocator>>,
    live: AtomicUsize,
}

impl Mmu {
    #[must_use]
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self::with_config(store, MmuConfig::default())
    }

    #[must_use]
    pub fn with_config(store: Arc<dyn TableStore>, config: MmuConfig) -> Self {
        Self {
            store,
            config,
            classes: SpinLock::new(Vec::new()),
            pools: SpinLock::new(PoolTable {
                pools: Vec::new(),
                next_id: 0,
            }),
            tag_space: Arc::new(SpinLock::new(RangeAllocator::new(0, config.tag_space))),
            live: AtomicUsize::new(0),
        }
    }

    /// Acquire a page-table block of `size` bytes at `align` alignment.
    ///
    /// Sub-granule alignments are served from slot pools; everything else
    /// reuses an idle block of the same size or allocates from the store.
    /// With `zero` set the block is returned zero-filled.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] when the store cannot back the request.
    pub fn pt_get(&self, size: u32, align: u32, zero: bool) -> Result<PtBlock> {
        debug_assert!(align.is_power_of_two());
        debug_assert!(size > 0 && size <= align || u64::from(align) >= GRANULE);

        let block = if u64::from(align) < GRANULE {
            self.pool_get(size, zero)?
        } else {
            self.class_get(size, align, zero)?
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    /// Release a block back to the cache.
    ///
    /// With `force` set the backing is freed instead of parked, also when
    /// a slot pool's parent becomes fully idle.
    pub fn pt_put(&self, block: PtBlock, force: bool) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        match block.owner {
            PtOwner::Class => self.class_put(block, force),
            PtOwner::Pool { .. } => self.pool_put(block, force),
        }
    }

    /// Free every idle block, returning the backing memory to the store.
    pub fn dump(&self) {
        let mut classes = self.classes.lock();
        let dropped: usize = classes.iter().map(|class| class.idle.len()).sum();
        for class in classes.iter_mut() {
            class.idle.clear();
        }
        drop(classes);
        log::debug!("released {dropped} idle page-table block(s)");
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let idle = self
            .classes
            .lock()
            .iter()
            .map(|class| class.idle.len())
            .sum();
        CacheStats {
            idle,
            live: self.live.load(Ordering::Relaxed),
            pools: self.pools.lock().pools.len(),
        }
    }

    fn class_get(&self, size: u32, align: u32, zero: bool) -> Result<PtBlock> {
        {
            let mut classes = self.classes.lock();
            if let Some(class) = classes.iter_mut().find(|class| class.size == size) {
                if !class.idle.is_empty() {
                    let block = class.idle.remove(0);
                    drop(classes);
                    log::trace!("cache hit: {size:#x} byte table at {:?}", block.addr());
                    // Recycled blocks still hold stale entries.
                    if zero {
                        block.zero_all();
                    }
                    return Ok(block);
                }
            } else {
                classes.push(SizeClass {
                    size,
                    idle: Vec::new(),
                });
            }
        }

        let memory = self.store.allocate(size, align, zero)?;
        log::trace!("cache miss: {size:#x} byte table at {:?}", memory.addr());
        Ok(PtBlock {
            addr: memory.addr(),
            memory,
            base: 0,
            size,
            owner: PtOwner::Class,
        })
    }

    fn class_put(&self, block: PtBlock, force: bool) {
        if !force {
            let mut classes = self.classes.lock();
            if let Some(class) = classes.iter_mut().find(|class| class.size == block.size) {
                if class.idle.len() < self.config.idle_cap {
                    class.idle.push(block);
                    return;
                }
            }
        }
        // Dropping the block releases the store allocation.
    }

    fn pool_get(&self, size: u32, zero: bool) -> Result<PtBlock> {
        let shift = size.next_power_of_two().trailing_zeros();
        let mut pools = self.pools.lock();

        let index = match pools
            .pools
            .iter()
            .position(|pool| pool.shift == shift && pool.free != 0)
        {
            Some(index) => index,
            None => {
                let parent = self.class_get(GRANULE as u32, GRANULE as u32, false)?;
                let slots = parent.size() >> shift;
                debug_assert!((1..=32).contains(&slots));
                let mask = if slots == 32 {
                    u32::MAX
                } else {
                    (1 << slots) - 1
                };
                let id = pools.next_id;
                pools.next_id += 1;
                log::debug!("new slot pool, {} byte slots", 1_u32 << shift);
                pools.pools.push(PtPool {
                    id,
                    parent,
                    shift,
                    mask,
                    free: mask,
                });
                pools.pools.len() - 1
            }
        };

        let pool = &mut pools.pools[index];
        let slot = pool.free.trailing_zeros();
        pool.free &= !(1 << slot);
        let base = slot << shift;
        let block = PtBlock {
            memory: Arc::clone(&pool.parent.memory),
            addr: pool.parent.addr + u64::from(base),
            base: pool.parent.base + base,
            size: 1 << shift,
            owner: PtOwner::Pool { pool: pool.id, shift },
        };
        drop(pools);

        if zero {
            block.zero_all();
        }
        Ok(block)
    }

    fn pool_put(&self, block: PtBlock, force: bool) {
        let PtOwner::Pool { pool: id, shift } = block.owner else {
            debug_assert!(false, "class block released through the pool path");
            return;
        };

        let mut pools = self.pools.lock();
        let Some(index) = pools.pools.iter().position(|pool| pool.id == id) else {
            debug_assert!(false, "slot released into a reclaimed pool");
            return;
        };
        let pool = &mut pools.pools[index];
        let slot = (block.base - pool.parent.base) >> shift;
        debug_assert!(pool.free & (1 << slot) == 0, "double release of a pool slot");
        pool.free |= 1 << slot;

        if pool.free == pool.mask {
            let pool = pools.pools.swap_remove(index);
            drop(pools);
            log::debug!("slot pool fully idle, reclaiming parent block");
            self.class_put(pool.parent, force);
        }
    }

    /// Attach a compression-tag range of `count` tags to `memory`.
    ///
    /// A live range already attached to the object is shared instead of
    /// allocating a second one. Returns `Ok(None)` when `count` is zero or
    /// the tag space is exhausted; callers then map uncompressed.
    ///
    /// # Errors
    /// None today; the signature leaves room for stores that must fail.
    pub fn tags_get(&self, memory: &MemoryObject, count: u64) -> Result<Option<Tags>> {
        if count == 0 {
            return Ok(None);
        }
        if let Some(tags) = memory.cached_tags() {
            if tags.count() >= count {
                return Ok(Some(tags));
            }
        }

        let offset = match self.tag_space.lock().alloc(count, 1) {
            Ok(offset) => offset,
            Err(MmuError::NoSpace) => return Ok(None),
            Err(error) => return Err(error),
        };
        let tags = Tags {
            inner: Arc::new(TagEntry {
                space: Arc::clone(&self.tag_space),
                offset,
                count,
            }),
        };
        memory.cache_tags(&tags);
        Ok(Some(tags))
    }
}

impl Drop for Mmu {
    fn drop(&mut self) {
        let live = self.live.load(Ordering::Relaxed);
        if live != 0 {
            log::warn!("dropping page-table cache with {live} block(s) still handed out");
        }
        debug_assert!(self.pools.lock().pools.is_empty() || live != 0);
    }
}
