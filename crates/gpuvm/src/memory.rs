//! Mappable memory objects and compression-tag ranges.
//!
//! A [`MemoryObject`] describes *what* gets mapped: a target (which bus the
//! pages live behind), a storage type, and one of three physical layouts.
//! It is a cheap handle; clones share the underlying description, and a
//! mapping holds a clone for as long as entries point at the memory.
//!
//! Compression tags are a global device resource. A [`Tags`] handle pins a
//! contiguous tag range; the range returns to the device-wide tag space
//! when the last handle drops. Each memory object caches a weak reference
//! to its tag range so that mapping the same object twice shares one range
//! instead of allocating a second.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use gpuvm_addresses::PhysicalAddress;
use gpuvm_sync::SpinLock;

use crate::mm::RangeAllocator;

/// Where the backing pages live.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryTarget {
    /// Device-local memory.
    Vram,
    /// Cache-coherent system memory.
    HostCoherent,
    /// Non-coherent system memory.
    HostNonCoherent,
    /// Device-local instance memory.
    Instance,
}

impl MemoryTarget {
    /// Whether unified-format entries for this target set the volatility
    /// bit. Only device-local targets are cacheable.
    #[must_use]
    pub const fn is_volatile(self) -> bool {
        !matches!(self, Self::Vram | Self::Instance)
    }
}

/// Storage type attached to a memory object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryType {
    /// Hardware storage-kind selector.
    pub kind: u8,
    /// Compression class; zero means uncompressed.
    pub comp: u8,
}

impl MemoryType {
    /// Plain linear, uncompressed storage.
    pub const LINEAR: Self = Self { kind: 0, comp: 0 };
}

/// One physically-contiguous piece of a scatter-gather mapping, in bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SgFragment {
    pub addr: PhysicalAddress,
    pub length: u64,
}

/// Physical layout of a memory object.
pub(crate) enum Backing {
    /// One contiguous run starting at `addr`.
    Contiguous { addr: PhysicalAddress },
    /// Variable-length fragments, each a whole number of pages.
    SgTable { fragments: Vec<SgFragment> },
    /// One granule page per element.
    SgList { pages: Vec<PhysicalAddress> },
}

struct MemoryInner {
    target: MemoryTarget,
    size: u64,
    memtype: MemoryType,
    backing: Backing,
    /// Tag range currently attached to this object, if any handle is live.
    tags: SpinLock<Weak<TagEntry>>,
}

/// Handle to a mappable memory description. Clones share the description.
#[derive(Clone)]
pub struct MemoryObject {
    inner: Arc<MemoryInner>,
}

impl MemoryObject {
    /// A single physically-contiguous run of `size` bytes.
    #[must_use]
    pub fn contiguous(
        target: MemoryTarget,
        addr: PhysicalAddress,
        size: u64,
        memtype: MemoryType,
    ) -> Self {
        Self::with_backing(target, size, memtype, Backing::Contiguous { addr })
    }

    /// Scatter-gather fragments; `size` is the sum of fragment lengths.
    #[must_use]
    pub fn sg_table(target: MemoryTarget, fragments: Vec<SgFragment>, memtype: MemoryType) -> Self {
        let size = fragments.iter().map(|fragment| fragment.length).sum();
        Self::with_backing(target, size, memtype, Backing::SgTable { fragments })
    }

    /// A page list, one granule page per element.
    #[must_use]
    pub fn sg_list(target: MemoryTarget, pages: Vec<PhysicalAddress>, memtype: MemoryType) -> Self {
        let size = pages.len() as u64 * crate::GRANULE;
        Self::with_backing(target, size, memtype, Backing::SgList { pages })
    }

    fn with_backing(target: MemoryTarget, size: u64, memtype: MemoryType, backing: Backing) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                target,
                size,
                memtype,
                backing,
                tags: SpinLock::new(Weak::new()),
            }),
        }
    }

    #[must_use]
    pub fn target(&self) -> MemoryTarget {
        self.inner.target
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    #[must_use]
    pub fn memtype(&self) -> MemoryType {
        self.inner.memtype
    }

    pub(crate) fn backing(&self) -> &Backing {
        &self.inner.backing
    }

    /// The live tag range attached to this object, if any.
    pub(crate) fn cached_tags(&self) -> Option<Tags> {
        self.inner.tags.lock().upgrade().map(|inner| Tags { inner })
    }

    pub(crate) fn cache_tags(&self, tags: &Tags) {
        *self.inner.tags.lock() = Arc::downgrade(&tags.inner);
    }
}

pub(crate) struct TagEntry {
    /// Device-wide tag space the range was carved from.
    pub(crate) space: Arc<SpinLock<RangeAllocator>>,
    pub(crate) offset: u64,
    pub(crate) count: u64,
}

impl Drop for TagEntry {
    fn drop(&mut self) {
        self.space.lock().free(self.offset, self.count);
    }
}

/// Shared handle to a contiguous compression-tag range.
///
/// The range stays reserved while any handle (or any mapping holding one)
/// is alive.
#[derive(Clone)]
pub struct Tags {
    pub(crate) inner: Arc<TagEntry>,
}

impl Tags {
    /// First tag index of the range.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.inner.offset
    }

    /// Number of tags in the range.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.inner.count
    }
}
