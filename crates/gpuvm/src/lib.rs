//! # GPU virtual-memory management
//!
//! A library implementing the memory-management core of a GPU driver: page
//! table backing-storage caching, virtual-address-space management, and the
//! translation of abstract mapping requests into hardware page-table
//! entries across several hardware generations.
//!
//! ## Layers
//!
//! ```text
//!  ┌────────────────────────────────────────────────────┐
//!  │               Mapping engine (map)                 │
//!  │   access rights + memory target + kind             │
//!  │     → generation-specific entry encoding           │
//!  └──────────────────────┬─────────────────────────────┘
//!  ┌──────────────────────▼─────────────────────────────┐
//!  │           Virtual address space (vm)               │
//!  │   first-fit range allocator, per-span page-table   │
//!  │   refcounts, Arc-based space lifetime              │
//!  └──────────────────────┬─────────────────────────────┘
//!  ┌──────────────────────▼─────────────────────────────┐
//!  │        Page-table block cache (cache)              │
//!  │   per-size idle lists + sub-granule slot pools     │
//!  └──────────────────────┬─────────────────────────────┘
//!  ┌──────────────────────▼─────────────────────────────┐
//!  │          Backing-memory seam (store)               │
//!  │   device-visible allocations, 64-bit entry I/O     │
//!  └────────────────────────────────────────────────────┘
//! ```
//!
//! The cache ([`Mmu`]) is an explicit service object shared by every
//! [`Vm`]; constructing one per test gives full isolation. All operations
//! are synchronous and callable from arbitrary threads; none are suitable
//! for interrupt context.
//!
//! ## Quick tour
//!
//! ```rust
//! use std::sync::Arc;
//! use gpuvm::{Access, MemoryObject, MemoryTarget, MemoryType, Mmu, PagingLayout, Vm};
//! use gpuvm::store::SystemStore;
//! use gpuvm_addresses::PhysicalAddress;
//!
//! let mmu = Arc::new(Mmu::new(Arc::new(SystemStore::new())));
//! let vm = Vm::new(&mmu, 0, 1 << 30, PagingLayout::gen2()).unwrap();
//!
//! let mut vma = vm.get(0x2000, 12, Access::RW).unwrap();
//! let buffer = MemoryObject::contiguous(
//!     MemoryTarget::Vram,
//!     PhysicalAddress::new(0x4000_0000),
//!     0x2000,
//!     MemoryType::LINEAR,
//! );
//! vma.map(&buffer).unwrap();
//! vma.unmap();
//! Vm::put(vma);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod cache;
pub mod layout;
pub mod map;
pub mod memory;
pub mod mm;
pub mod pte;
pub mod store;
pub mod vm;

pub use cache::{CacheStats, Mmu, MmuConfig, PtBlock};
pub use layout::{Generation, PageDesc, PagingLayout, TableDesc};
pub use memory::{MemoryObject, MemoryTarget, MemoryType, SgFragment, Tags};
pub use vm::{Vm, VmHooks, Vma};

/// Smallest mappable unit and the allocation granule for full-size page
/// tables. Sub-granule page tables are packed into one granule by the pool
/// sub-allocator.
pub const GRANULE: u64 = 0x1000;

/// `log2(GRANULE)`.
pub const GRANULE_SHIFT: u32 = 12;

bitflags::bitflags! {
    /// Access rights attached to a reserved range.
    ///
    /// `SYSTEM` marks privileged mappings; entry encoders translate it into
    /// the privilege bit of the generation's entry layout.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SYSTEM = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Failure modes of the memory-management core.
///
/// Every variant is recoverable by the caller; operations that fail leave
/// no partial reservation behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmuError {
    /// Backing allocation for page-table memory (or address-space
    /// bootstrap) failed.
    #[error("backing allocation for page-table memory failed")]
    OutOfMemory,

    /// The range allocator cannot satisfy the requested size/alignment.
    #[error("no free range of the requested size and alignment")]
    NoSpace,

    /// No entry encoder is registered for this generation and page-size
    /// combination; detected before any entry write.
    #[error("no page-table entry encoder for {generation:?} at page shift {shift}")]
    UnsupportedConfiguration {
        generation: Generation,
        shift: u32,
    },
}

pub type Result<T> = core::result::Result<T, MmuError>;
