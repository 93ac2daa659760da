//! Clock drivers
//!
//! Hardware timers that implement [`ClockDriver`](crate::timer::driver::ClockDriver)
//! for the timeout core, plus a software clock for hosted builds and tests.

pub mod manual;
pub mod mtime;
pub mod systick;

pub use manual::ManualClock;
pub use mtime::{MtimeDriver, MtimeMmio, MtimeRegisters};
pub use systick::{SysTickCtrl, SysTickDriver, SysTickMmio, SysTickRegisters};
