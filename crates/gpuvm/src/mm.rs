//! First-fit address-range allocator.
//!
//! Backs two unrelated resources: the virtual-address range of each address
//! space (in granule-page units) and the global compression-tag space (in
//! tag indices). The free list is a sorted `Vec` of extents; allocation is
//! first-fit in address order, which makes placement deterministic — freeing
//! a range and allocating the same size again yields the same offset.

use alloc::vec::Vec;

use crate::{MmuError, Result};

/// One free extent, `[offset, offset + length)`, in caller-defined units.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Extent {
    offset: u64,
    length: u64,
}

/// First-fit, address-ordered range allocator.
///
/// # Invariants
/// - Free extents are sorted by offset, non-overlapping, and non-adjacent
///   (adjacent extents are coalesced on free).
/// - All extents lie within `[start, start + total)`.
pub struct RangeAllocator {
    free: Vec<Extent>,
    start: u64,
    total: u64,
}

impl RangeAllocator {
    /// Manage the range `[start, start + length)`.
    #[must_use]
    pub fn new(start: u64, length: u64) -> Self {
        let mut free = Vec::with_capacity(8);
        if length > 0 {
            free.push(Extent {
                offset: start,
                length,
            });
        }
        Self {
            free,
            start,
            total: length,
        }
    }

    /// Reserve `length` units at an offset that is a multiple of `align`.
    ///
    /// Scans the free list in address order and carves the reservation out
    /// of the first extent that can hold it, splitting off head and tail
    /// remainders as needed.
    ///
    /// # Errors
    /// [`MmuError::NoSpace`] if no extent can satisfy the request.
    pub fn alloc(&mut self, length: u64, align: u64) -> Result<u64> {
        debug_assert!(length > 0, "zero-length range reservation");
        debug_assert!(align.is_power_of_two());

        for index in 0..self.free.len() {
            let extent = self.free[index];
            let offset = gpuvm_addresses::align_up(extent.offset, align);
            let head = offset - extent.offset;
            if head + length > extent.length {
                continue;
            }
            let tail = extent.length - head - length;

            match (head > 0, tail > 0) {
                (false, false) => {
                    self.free.remove(index);
                }
                (true, false) => {
                    self.free[index].length = head;
                }
                (false, true) => {
                    self.free[index].offset = offset + length;
                    self.free[index].length = tail;
                }
                (true, true) => {
                    self.free[index].length = head;
                    self.free.insert(
                        index + 1,
                        Extent {
                            offset: offset + length,
                            length: tail,
                        },
                    );
                }
            }
            return Ok(offset);
        }
        Err(MmuError::NoSpace)
    }

    /// Return `[offset, offset + length)` to the free list, coalescing with
    /// both neighbours where they touch.
    ///
    /// Freeing units that are already free is a caller bug.
    pub fn free(&mut self, offset: u64, length: u64) {
        debug_assert!(length > 0);
        debug_assert!(offset >= self.start && offset + length <= self.start + self.total);

        let index = self.free.partition_point(|extent| extent.offset < offset);
        debug_assert!(
            index == 0 || {
                let prev = self.free[index - 1];
                prev.offset + prev.length <= offset
            },
            "double free of range units"
        );
        debug_assert!(
            index == self.free.len() || offset + length <= self.free[index].offset,
            "double free of range units"
        );

        // Merge with the successor first, then with the predecessor.
        let mut merged = Extent { offset, length };
        if index < self.free.len() && merged.offset + merged.length == self.free[index].offset {
            merged.length += self.free[index].length;
            self.free.remove(index);
        }
        if index > 0 {
            let prev = self.free[index - 1];
            if prev.offset + prev.length == merged.offset {
                self.free[index - 1].length += merged.length;
                return;
            }
        }
        self.free.insert(index, merged);
    }

    /// Whether every unit is free again.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.total == 0 || (self.free.len() == 1 && self.free[0].length == self.total)
    }

    /// Total free units.
    #[must_use]
    pub fn free_units(&self) -> u64 {
        self.free.iter().map(|extent| extent.length).sum()
    }
}
