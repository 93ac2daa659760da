//! Synchronization Primitives
//!
//! The timing core runs before any scheduler exists and is entered from
//! interrupt context, so its only lock is a spinlock that also masks local
//! interrupts for as long as it is held.

pub mod spinlock;

pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
