//! The mapping engine: turns a memory object into page-table entries.
//!
//! Mapping is a [`Vma`] operation because the reservation fixes everything
//! positional: the virtual address, the page size, and the access rights.
//! The memory object contributes the physical layout, the target (which
//! decides the volatility bit on unified entries), and the storage type.
//! Compression is best-effort: when the storage type requests it, a tag
//! range is attached if the device has one free, otherwise the mapping
//! silently degrades to uncompressed.
//!
//! All entries for one call are written under the address-space lock, so
//! concurrent maps of disjoint reservations never interleave partially
//! within a table.

use alloc::sync::Arc;

use crate::layout::TableDesc;
use crate::memory::{Backing, MemoryObject, Tags};
use crate::pte::{EntryAttrs, PteFormat};
use crate::vm::{Vma, VmState};
use crate::{Access, GRANULE_SHIFT, Result};

/// Walks a reserved range entry by entry, resolving the page table for
/// each directory span from the space's live-table map.
struct EntryCursor<'a> {
    state: &'a VmState,
    page_index: usize,
    table: TableDesc,
    page_shift: u32,
    vaddr: u64,
}

impl EntryCursor<'_> {
    fn write(&mut self, value: u64) {
        let pde = self.vaddr >> self.table.span_shift;
        let ei = (self.vaddr >> self.page_shift) & (self.table.entries(self.page_shift) - 1);
        match self.state.pgt.get(&(self.page_index, pde)) {
            Some(slot) => slot.pt.write_entry(ei as u32, value),
            None => debug_assert!(false, "entry write outside the reserved range"),
        }
        self.vaddr += 1 << self.page_shift;
    }
}

impl Vma {
    /// Map `memory` at the start of the reservation.
    ///
    /// # Errors
    /// See [`map_at`](Self::map_at).
    pub fn map(&mut self, memory: &MemoryObject) -> Result<()> {
        self.map_at(0, memory)
    }

    /// Map `memory` starting `delta` bytes into the reservation.
    ///
    /// `delta` and the object size must be multiples of the reservation's
    /// page size, and the object must fit. The reservation keeps a
    /// reference to the object (and to its tag range, if one was attached)
    /// until [`unmap`](Self::unmap) or release.
    ///
    /// # Errors
    /// [`MmuError::UnsupportedConfiguration`](crate::MmuError) if the
    /// layout's generation has no entry encoder at this page size; nothing
    /// is written then.
    pub fn map_at(&mut self, delta: u64, memory: &MemoryObject) -> Result<()> {
        let inner = Arc::clone(&self.vm.inner);
        let page = 1_u64 << self.page_shift;
        debug_assert!(delta % page == 0);
        debug_assert!(memory.size() > 0 && memory.size() % page == 0);
        debug_assert!(delta + memory.size() <= self.size);

        let Some(table) = inner.layout.page_at(self.page_index).table else {
            // Flat scheme: translations are fixed, only the reference moves.
            self.memory = Some(memory.clone());
            return Ok(());
        };
        let format = PteFormat::select(inner.layout.generation, self.page_shift)?;

        let memtype = memory.memtype();
        let tags = if memtype.comp != 0 {
            inner.mmu.tags_get(memory, memory.size() >> GRANULE_SHIFT)?
        } else {
            None
        };
        // A range ending past the entry's tag field cannot be encoded;
        // treat it like exhaustion and map uncompressed.
        let tags = tags.filter(|tags| tags.base() + tags.count() <= PteFormat::TAG_LIMIT);
        let tag_base = tags.as_ref().map(Tags::base);
        let attrs = EntryAttrs {
            ro: !self.access.contains(Access::WRITE),
            privileged: self.access.contains(Access::SYSTEM),
            vol: memory.target().is_volatile(),
            kind: memtype.kind,
            comp: memtype.comp,
        };

        let state = inner.state.lock();
        let mut cursor = EntryCursor {
            state: &state,
            page_index: self.page_index,
            table,
            page_shift: self.page_shift,
            vaddr: self.addr + delta,
        };

        // Tag indices advance per granule page of the object, so a range
        // attached once stays valid for any placement of the same object.
        match memory.backing() {
            Backing::SgTable { fragments } => {
                let mut offset = 0;
                for fragment in fragments {
                    debug_assert!(fragment.length % page == 0);
                    let mut phys = fragment.addr;
                    let mut remaining = fragment.length;
                    while remaining != 0 {
                        let tag = tag_base.map(|base| base + (offset >> GRANULE_SHIFT));
                        cursor.write(format.encode(&attrs, phys, tag));
                        phys += page;
                        offset += page;
                        remaining -= page;
                    }
                }
            }
            Backing::SgList { pages } => {
                // Page lists are granule-granular by construction.
                debug_assert!(self.page_shift == GRANULE_SHIFT);
                for (index, &phys) in pages.iter().enumerate() {
                    let tag = tag_base.map(|base| base + index as u64);
                    cursor.write(format.encode(&attrs, phys, tag));
                }
            }
            Backing::Contiguous { addr } => {
                for index in 0..memory.size() >> self.page_shift {
                    let offset = index << self.page_shift;
                    let tag = tag_base.map(|base| base + (offset >> GRANULE_SHIFT));
                    cursor.write(format.encode(&attrs, *addr + offset, tag));
                }
            }
        }
        drop(state);
        log::trace!(
            "mapped {:#x} byte(s) at {:#x}, compressed={}",
            memory.size(),
            self.addr + delta,
            tags.is_some()
        );

        self.tags = tags;
        self.memory = Some(memory.clone());
        Ok(())
    }

    /// Invalidate the entries for `[delta, delta + length)` within the
    /// reservation. No-op on flat schemes.
    pub fn unmap_range(&mut self, delta: u64, length: u64) {
        let inner = &self.vm.inner;
        let Some(table) = inner.layout.page_at(self.page_index).table else {
            return;
        };
        let page = 1_u64 << self.page_shift;
        debug_assert!(delta % page == 0 && length % page == 0);
        debug_assert!(delta + length <= self.size);
        if length == 0 {
            return;
        }

        let state = inner.state.lock();
        let start = self.addr + delta;
        let end = start + length;
        let mut vaddr = start;
        while vaddr < end {
            let pde = vaddr >> table.span_shift;
            let span_end = end.min((pde + 1) << table.span_shift);
            let ei = (vaddr >> self.page_shift) & (table.entries(self.page_shift) - 1);
            let count = (span_end - vaddr) >> self.page_shift;
            match state.pgt.get(&(self.page_index, pde)) {
                Some(slot) => slot.pt.fill_entries(ei as u32, 0, count as u32),
                None => debug_assert!(false, "entry clear outside the reserved range"),
            }
            vaddr = span_end;
        }
        drop(state);
        log::trace!("cleared entries for [{start:#x}, {end:#x})");
    }

    /// Invalidate every entry of the reservation and drop the references
    /// to the mapped object and its tag range.
    pub fn unmap(&mut self) {
        self.unmap_range(0, self.size);
        self.memory = None;
        self.tags = None;
    }
}
