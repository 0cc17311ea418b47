//! Hardware paging-scheme descriptors.
//!
//! A [`PagingLayout`] captures everything the core needs to know about one
//! hardware family's MMU: which page sizes exist, how much virtual address
//! space one page table spans at each size, how large the table's backing
//! allocation is, and whether the family needs a root table bootstrapped
//! when an address space is created.
//!
//! The layouts constructed here model four generations:
//!
//! | Generation | Small pages | Large pages | Notes |
//! |------------|-------------|-------------|-------|
//! | [`Gen1`](Generation::Gen1) | 4 KiB | 64 KiB (no encoder) | legacy entry layout |
//! | [`Gen2`](Generation::Gen2) | 4 KiB | 2 MiB | unified entry layout |
//! | [`Gen3`](Generation::Gen3) | 4 KiB | 2 MiB | wider kind field |
//! | [`Gen4`](Generation::Gen4) | 4 KiB | 64 KiB, 256 B sub-granule tables | pool sub-allocation |
//!
//! plus a flat scheme whose mappings are permanently resident and never
//! materialize explicit entries.

use alloc::vec;
use alloc::vec::Vec;

use crate::{GRANULE, GRANULE_SHIFT};

/// Hardware generation families with distinct page-table entry layouts.
///
/// The set is closed on purpose: the mapping engine selects exactly one
/// encoder per generation through a single `match`, and a combination
/// without an encoder is rejected before any entry write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Generation {
    /// Oldest supported family; packs the compression class directly into
    /// the entry and has no large-page encoder.
    Gen1,
    /// First unified-layout family; derives the volatility bit from the
    /// memory target.
    Gen2,
    /// Unified layout with the full 8-bit kind range.
    Gen3,
    /// Unified layout; the large-page class uses sub-granule page tables.
    Gen4,
}

/// Geometry of one page table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableDesc {
    /// log2 of the virtual-address bytes covered by one table.
    pub span_shift: u32,
    /// Backing allocation size in bytes (entry count × 8).
    pub size: u32,
    /// Backing alignment; below the granule this routes the allocation
    /// through the pool sub-allocator.
    pub align: u32,
}

impl TableDesc {
    /// Geometry for tables of `1 << (span_shift - page_shift)` entries.
    #[must_use]
    pub const fn new(page_shift: u32, span_shift: u32) -> Self {
        assert!(span_shift > page_shift);
        let entries = 1_u32 << (span_shift - page_shift);
        let size = entries * 8;
        let align = if (size as u64) < GRANULE {
            size
        } else {
            GRANULE as u32
        };
        Self {
            span_shift,
            size,
            align,
        }
    }

    /// Entry count for pages of `page_shift`.
    #[must_use]
    pub const fn entries(&self, page_shift: u32) -> u64 {
        1 << (self.span_shift - page_shift)
    }
}

/// One supported page-size class.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageDesc {
    /// log2 page size in bytes.
    pub shift: u32,
    /// Explicit page-table geometry, or `None` for permanently-resident
    /// flat schemes (no entries are ever written).
    pub table: Option<TableDesc>,
}

impl PageDesc {
    /// Whether this is the granule-sized small-page class.
    #[must_use]
    pub const fn is_small(&self) -> bool {
        self.shift == GRANULE_SHIFT
    }
}

/// Paging description for one hardware family.
pub struct PagingLayout {
    pub generation: Generation,
    /// Page-size classes, largest first.
    pages: Vec<PageDesc>,
    /// Root table bootstrapped at address-space construction, if the
    /// family requires one.
    pub root: Option<TableDesc>,
}

impl PagingLayout {
    /// Legacy family: 4 KiB pages only. The 64 KiB class is present in
    /// hardware but has no entry encoder; mapping through it is rejected.
    #[must_use]
    pub fn gen1() -> Self {
        Self {
            generation: Generation::Gen1,
            pages: vec![
                PageDesc {
                    shift: 16,
                    table: Some(TableDesc::new(16, 21)),
                },
                PageDesc {
                    shift: 12,
                    table: Some(TableDesc::new(12, 21)),
                },
            ],
            root: Some(TableDesc {
                span_shift: 40,
                size: GRANULE as u32,
                align: GRANULE as u32,
            }),
        }
    }

    /// First unified family: 4 KiB and 2 MiB pages, granule-sized tables.
    #[must_use]
    pub fn gen2() -> Self {
        Self {
            generation: Generation::Gen2,
            pages: vec![
                PageDesc {
                    shift: 21,
                    table: Some(TableDesc::new(21, 30)),
                },
                PageDesc {
                    shift: 12,
                    table: Some(TableDesc::new(12, 21)),
                },
            ],
            root: Some(TableDesc {
                span_shift: 40,
                size: GRANULE as u32,
                align: GRANULE as u32,
            }),
        }
    }

    /// Like [`gen2`](Self::gen2) with the full kind range.
    #[must_use]
    pub fn gen3() -> Self {
        Self {
            generation: Generation::Gen3,
            ..Self::gen2()
        }
    }

    /// Newest family: the 64 KiB large-page tables are 256 bytes, far
    /// below the allocation granule, and are packed into shared granule
    /// blocks by the pool sub-allocator.
    #[must_use]
    pub fn gen4() -> Self {
        Self {
            generation: Generation::Gen4,
            pages: vec![
                PageDesc {
                    shift: 16,
                    table: Some(TableDesc::new(16, 21)),
                },
                PageDesc {
                    shift: 12,
                    table: Some(TableDesc::new(12, 21)),
                },
            ],
            root: Some(TableDesc {
                span_shift: 40,
                size: GRANULE as u32,
                align: GRANULE as u32,
            }),
        }
    }

    /// Permanently-resident flat scheme: address ranges are carved out but
    /// no page tables exist and `map`/`unmap` never touch entries.
    #[must_use]
    pub fn flat() -> Self {
        Self {
            generation: Generation::Gen1,
            pages: vec![PageDesc {
                shift: GRANULE_SHIFT,
                table: None,
            }],
            root: None,
        }
    }

    /// The page-size class for `page_shift`, with its index.
    #[must_use]
    pub fn page(&self, page_shift: u32) -> Option<(usize, PageDesc)> {
        self.pages
            .iter()
            .enumerate()
            .find(|(_, desc)| desc.shift == page_shift)
            .map(|(index, desc)| (index, *desc))
    }

    /// The page-size class at `index` (as returned by [`page`](Self::page)).
    #[must_use]
    pub(crate) fn page_at(&self, index: usize) -> PageDesc {
        self.pages[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_geometry() {
        let small = TableDesc::new(12, 21);
        assert_eq!(small.entries(12), 512);
        assert_eq!(small.size, 4096);
        assert_eq!(small.align, 4096);

        let sub = TableDesc::new(16, 21);
        assert_eq!(sub.entries(16), 32);
        assert_eq!(sub.size, 256);
        assert_eq!(sub.align, 256);
    }

    #[test]
    fn layouts_resolve_page_shifts() {
        let layout = PagingLayout::gen2();
        let (_, small) = layout.page(12).unwrap();
        assert!(small.is_small());
        let (_, large) = layout.page(21).unwrap();
        assert!(!large.is_small());
        assert!(layout.page(16).is_none());

        assert!(PagingLayout::gen4().page(16).is_some());
        assert!(PagingLayout::flat().page(12).unwrap().1.table.is_none());
    }
}
