//! Backing-memory seam for page tables.
//!
//! Page-table contents live in device-visible memory; where that memory
//! comes from is the integrator's business. [`TableStore`] is the allocation
//! seam and [`TableMemory`] the accessor surface (device address plus 64-bit
//! entry read/write). [`SystemStore`] is a heap-backed implementation used
//! by tests and by integrations that keep tables in host-coherent memory.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use gpuvm_addresses::PhysicalAddress;
use gpuvm_sync::SpinLock;

use crate::{MmuError, Result};

/// One device-visible backing allocation holding page-table entries.
///
/// Offsets are in bytes and must be 8-aligned; entries are 64-bit.
pub trait TableMemory: Send + Sync {
    /// Device-visible base address of the allocation.
    fn addr(&self) -> PhysicalAddress;

    /// Allocation size in bytes.
    fn size(&self) -> u32;

    /// Read the entry at byte `offset`.
    fn rd64(&self, offset: u32) -> u64;

    /// Write the entry at byte `offset`.
    fn wr64(&self, offset: u32, value: u64);

    /// Fill `count` consecutive entries starting at byte `offset`.
    fn fill(&self, offset: u32, value: u64, count: u32) {
        for index in 0..count {
            self.wr64(offset + index * 8, value);
        }
    }
}

/// Allocator for page-table backing memory.
///
/// Returned allocations must be at least `align`-aligned in the device
/// address space. Implementations decide the memory target; the cache layer
/// on top never cares.
pub trait TableStore: Send + Sync {
    /// Allocate `size` bytes of device-visible memory.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] when backing memory is exhausted.
    fn allocate(&self, size: u32, align: u32, zero: bool) -> Result<Arc<dyn TableMemory>>;
}

/// Heap-backed [`TableStore`].
///
/// Device addresses are assigned from a bump counter so distinct
/// allocations never alias; entry storage is a locked `Vec<u64>`.
pub struct SystemStore {
    next_addr: AtomicU64,
}

impl SystemStore {
    #[must_use]
    pub const fn new() -> Self {
        // Leave device page zero unused so a zero address never appears.
        Self {
            next_addr: AtomicU64::new(0x10_0000),
        }
    }
}

impl Default for SystemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore for SystemStore {
    fn allocate(&self, size: u32, align: u32, zero: bool) -> Result<Arc<dyn TableMemory>> {
        debug_assert!(size > 0 && size % 8 == 0);
        debug_assert!(align.is_power_of_two());

        let words = usize::try_from(size / 8).map_err(|_| MmuError::OutOfMemory)?;
        let align = u64::from(align.max(8));
        let addr = loop {
            let current = self.next_addr.load(Ordering::Relaxed);
            let aligned = gpuvm_addresses::align_up(current, align);
            if self
                .next_addr
                .compare_exchange(
                    current,
                    aligned + u64::from(size),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break aligned;
            }
        };

        // Fresh heap memory; the `zero` flag only matters for stores that
        // recycle device allocations.
        let _ = zero;
        Ok(Arc::new(SystemTable {
            addr: PhysicalAddress::new(addr),
            words: SpinLock::new(vec![0; words]),
        }))
    }
}

struct SystemTable {
    addr: PhysicalAddress,
    words: SpinLock<Vec<u64>>,
}

impl TableMemory for SystemTable {
    fn addr(&self) -> PhysicalAddress {
        self.addr
    }

    fn size(&self) -> u32 {
        u32::try_from(self.words.lock().len() * 8).unwrap_or(u32::MAX)
    }

    fn rd64(&self, offset: u32) -> u64 {
        debug_assert!(offset % 8 == 0);
        self.words.lock()[offset as usize / 8]
    }

    fn wr64(&self, offset: u32, value: u64) {
        debug_assert!(offset % 8 == 0);
        self.words.lock()[offset as usize / 8] = value;
    }

    fn fill(&self, offset: u32, value: u64, count: u32) {
        debug_assert!(offset % 8 == 0);
        let mut words = self.words.lock();
        let start = offset as usize / 8;
        words[start..start + count as usize].fill(value);
    }
}
