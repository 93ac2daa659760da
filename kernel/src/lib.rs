//! Tickless Kernel Timeout Library
//!
//! The timing core of a small real-time kernel: a delta-encoded queue of
//! pending timeouts, the announce path that the hardware timer interrupt
//! drives, a monotonic 64-bit tick base, and the interrupt-masking spinlock
//! everything is built on.
//!
//! The crate is `no_std` on real targets. Under `cfg(test)` it links `std`
//! so the whole subsystem can be exercised on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod sync;
pub mod timer;

pub use error::{KernelError, KernelResult};
pub use sync::spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use timer::{
    config::{ClockConfig, ClockFlags},
    driver::ClockDriver,
    timeout::{Ticks, Timeout, TimeoutId, TICKS_FOREVER},
    AnnounceSummary, TimeoutFn, TimerSystem,
};
