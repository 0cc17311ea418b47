//! Page-table entry layouts and their encoders.
//!
//! Two wire formats cover the supported hardware families. The legacy
//! layout carries the compression class inside the entry and exists only
//! for granule pages; the unified layout adds a volatility bit and a full
//! 8-bit kind field and is shared by every later family.
//!
//! An invalid entry is all-zero in both formats.

use bitfield_struct::bitfield;
use gpuvm_addresses::PhysicalAddress;

use crate::layout::Generation;
use crate::{GRANULE_SHIFT, MmuError, Result};

/// Legacy entry layout (granule pages only).
#[bitfield(u64)]
pub struct LegacyPte {
    /// Translation is present.
    pub valid: bool,
    /// Compression class; zero means uncompressed.
    #[bits(2)]
    pub comp: u8,
    /// Writes fault.
    pub ro: bool,
    /// Accessible from privileged engines only.
    pub privileged: bool,
    /// Storage-kind selector.
    #[bits(7)]
    pub kind: u8,
    /// Physical page index (`addr >> 12`).
    #[bits(28)]
    pub page: u32,
    /// Compression-tag index, meaningful when `comp != 0`.
    #[bits(12)]
    pub tag: u16,
    #[bits(12)]
    __: u16,
}

/// Unified entry layout.
#[bitfield(u64)]
pub struct UnifiedPte {
    /// Translation is present.
    pub valid: bool,
    /// Bypass caches; set for mappings of non-device memory.
    pub vol: bool,
    /// Writes fault.
    pub ro: bool,
    /// Accessible from privileged engines only.
    pub privileged: bool,
    /// Physical page index (`addr >> 12`).
    #[bits(36)]
    pub page: u64,
    /// Storage-kind selector.
    #[bits(8)]
    pub kind: u8,
    /// Compression-tag index, meaningful when a tag range is attached.
    #[bits(12)]
    pub tag: u16,
    #[bits(4)]
    __: u8,
}

/// Attributes shared by every entry written for one mapping operation.
///
/// The per-entry physical address and tag index are supplied at encode
/// time; everything else is fixed when the operation starts.
#[derive(Copy, Clone, Debug)]
pub struct EntryAttrs {
    pub ro: bool,
    pub privileged: bool,
    /// Volatility of the backing target; ignored by the legacy format.
    pub vol: bool,
    pub kind: u8,
    /// Compression class; zero disables compression.
    pub comp: u8,
}

/// Entry format selected for one generation and page-size combination.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PteFormat {
    Legacy,
    Unified,
}

impl PteFormat {
    /// Exclusive upper bound on tag indices; both layouts carry a 12-bit
    /// tag field. Ranges reaching past it cannot be encoded.
    pub const TAG_LIMIT: u64 = 1 << 12;

    /// Pick the encoder for `generation` at `page_shift`.
    ///
    /// # Errors
    /// [`MmuError::UnsupportedConfiguration`] when the combination has no
    /// encoder. The legacy family only encodes granule pages.
    pub fn select(generation: Generation, page_shift: u32) -> Result<Self> {
        match generation {
            Generation::Gen1 if page_shift == GRANULE_SHIFT => Ok(Self::Legacy),
            Generation::Gen1 => Err(MmuError::UnsupportedConfiguration {
                generation,
                shift: page_shift,
            }),
            Generation::Gen2 | Generation::Gen3 | Generation::Gen4 => Ok(Self::Unified),
        }
    }

    /// Encode one valid entry.
    ///
    /// `tag` is the compression-tag index for this entry, or `None` when
    /// the mapping is uncompressed (no tag range could be attached, or
    /// `attrs.comp` is zero).
    #[must_use]
    pub fn encode(self, attrs: &EntryAttrs, phys: PhysicalAddress, tag: Option<u64>) -> u64 {
        let page = phys.as_u64() >> GRANULE_SHIFT;
        match self {
            Self::Legacy => {
                let comp = if tag.is_some() { attrs.comp } else { 0 };
                LegacyPte::new()
                    .with_valid(true)
                    .with_comp(comp)
                    .with_ro(attrs.ro)
                    .with_privileged(attrs.privileged)
                    .with_kind(attrs.kind & 0x7F)
                    .with_page(page as u32)
                    .with_tag(tag.unwrap_or(0) as u16)
                    .into_bits()
            }
            Self::Unified => UnifiedPte::new()
                .with_valid(true)
                .with_vol(attrs.vol)
                .with_ro(attrs.ro)
                .with_privileged(attrs.privileged)
                .with_page(page)
                .with_kind(attrs.kind)
                .with_tag(tag.unwrap_or(0) as u16)
                .into_bits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTRS: EntryAttrs = EntryAttrs {
        ro: false,
        privileged: false,
        vol: false,
        kind: 0,
        comp: 0,
    };

    #[test]
    fn invalid_entry_is_zero() {
        assert_eq!(LegacyPte::new().into_bits(), 0);
        assert_eq!(UnifiedPte::new().into_bits(), 0);
    }

    #[test]
    fn unified_round_trips_address_and_bits() {
        let raw = PteFormat::Unified.encode(
            &EntryAttrs {
                ro: true,
                privileged: true,
                vol: true,
                kind: 0xFE,
                comp: 0,
            },
            PhysicalAddress::new(0x1_2345_6000),
            None,
        );
        let pte = UnifiedPte::from_bits(raw);
        assert!(pte.valid());
        assert!(pte.vol());
        assert!(pte.ro());
        assert!(pte.privileged());
        assert_eq!(pte.kind(), 0xFE);
        assert_eq!(pte.page() << 12, 0x1_2345_6000);
        assert_eq!(pte.tag(), 0);
    }

    #[test]
    fn legacy_clears_comp_without_a_tag() {
        let attrs = EntryAttrs {
            comp: 2,
            ..ATTRS
        };
        let without = LegacyPte::from_bits(PteFormat::Legacy.encode(
            &attrs,
            PhysicalAddress::new(0x4000),
            None,
        ));
        assert_eq!(without.comp(), 0);
        assert_eq!(without.tag(), 0);

        let with = LegacyPte::from_bits(PteFormat::Legacy.encode(
            &attrs,
            PhysicalAddress::new(0x4000),
            Some(0x123),
        ));
        assert_eq!(with.comp(), 2);
        assert_eq!(with.tag(), 0x123);
        assert_eq!(with.page(), 0x4);
    }

    #[test]
    fn legacy_rejects_large_pages() {
        assert!(PteFormat::select(Generation::Gen1, 12).is_ok());
        assert_eq!(
            PteFormat::select(Generation::Gen1, 16),
            Err(MmuError::UnsupportedConfiguration {
                generation: Generation::Gen1,
                shift: 16,
            })
        );
        assert_eq!(PteFormat::select(Generation::Gen4, 16), Ok(PteFormat::Unified));
    }
}
