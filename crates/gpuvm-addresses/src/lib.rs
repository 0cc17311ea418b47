//! # GPU and bus address types
//!
//! Zero-cost `u64` newtypes that keep the two address kinds flowing through
//! the memory manager apart at compile time:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`DeviceAddress`] | A GPU **virtual** address, translated by the GPU MMU. |
//! | [`PhysicalAddress`] | A bus address of backing memory (video memory or host pages). |
//!
//! Page sizes on GPUs vary per hardware family and are selected at runtime
//! from a paging layout, so shifts and sizes are plain values here rather
//! than type-level markers; the [`align_up`]/[`align_down`] helpers cover
//! the arithmetic both address kinds need.

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::ops::{Add, AddAssign};

/// A GPU virtual address.
///
/// Values of this type are offsets into one [GPU address
/// space](https://en.wikipedia.org/wiki/Input%E2%80%93output_memory_management_unit);
/// they are only meaningful together with the `Vm` that issued them.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the low `shift` bits are clear.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, shift: u32) -> bool {
        self.0 & ((1 << shift) - 1) == 0
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DA(0x{:012X})", self.0)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012X}", self.0)
    }
}

impl From<u64> for DeviceAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Add<u64> for DeviceAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for DeviceAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// A bus address of backing memory.
///
/// Depending on the memory target this is a video-memory offset or a
/// host-page bus address; page-table entries store it page-aligned with the
/// low bits repurposed for attribute fields.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the low `shift` bits are clear.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, shift: u32) -> bool {
        self.0 & ((1 << shift) - 1) == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:012X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; the result is the greatest
/// `y <= x` with `y % a == 0`.
///
/// ### Examples
/// ```rust
/// # use gpuvm_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// assert_eq!(align_down(0x1_2345, 16), 0x1_2340);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow;
/// the result is the smallest `y >= x` with `y % a == 0`.
///
/// ### Examples
/// ```rust
/// # use gpuvm_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x1_2345, 16), 0x1_2350);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_alignment() {
        let da = DeviceAddress::new(0x20_0000);
        assert!(da.is_aligned(12));
        assert!(da.is_aligned(21));
        assert!(!(da + 0x1000).is_aligned(21));
    }

    #[test]
    fn physical_address_arithmetic() {
        let mut pa = PhysicalAddress::new(0x3000);
        pa += 0x1000;
        assert_eq!(pa.as_u64(), 0x4000);
        assert_eq!((pa + 0x234).as_u64(), 0x4234);
        assert!(!(pa + 0x234).is_aligned(12));
    }

    #[test]
    fn formatting_distinguishes_kinds() {
        let da = DeviceAddress::new(0xABC);
        let pa = PhysicalAddress::new(0xABC);
        assert_eq!(format!("{da:?}"), "DA(0x000000000ABC)");
        assert_eq!(format!("{pa:?}"), "PA(0x000000000ABC)");
        assert_eq!(format!("{da}"), format!("{pa}"));
    }

    #[test]
    fn align_helpers_round_trip() {
        for shift in [12_u64, 16, 21] {
            let a = 1 << shift;
            assert_eq!(align_up(align_down(a * 3 + 5, a), a), a * 3);
            assert_eq!(align_down(align_up(a * 3 + 5, a), a), a * 4);
        }
    }
}
