//! # Synchronization primitives for the GPU memory manager
//!
//! The memory-management core is called synchronously from arbitrary host
//! threads and never from interrupt context, so a plain spin mutex is all it
//! needs: critical sections are short (free-list and bitmask bookkeeping,
//! page-table entry writes) and never block on anything but another CPU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
