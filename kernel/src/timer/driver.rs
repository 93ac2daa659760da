//! Clock driver contract.
//!
//! Each hardware timer is turned into the three operations the timeout
//! core needs (start counting, arm the next deadline, report unannounced
//! progress) plus an interrupt hook that reports how many whole ticks have
//! newly elapsed. Drivers keep their own lock; the core calls
//! [`set_timeout`](ClockDriver::set_timeout) and
//! [`elapsed`](ClockDriver::elapsed) while holding the timeout lock, so a
//! driver must never call back into the [`TimerSystem`] from those.
//!
//! # Implementations
//!
//! * [`SysTickDriver`](crate::drivers::systick::SysTickDriver) -- 24-bit
//!   down-counter.
//! * [`MtimeDriver`](crate::drivers::mtime::MtimeDriver) -- 64-bit
//!   up-counter with 32-bit register access.
//! * [`ManualClock`](crate::drivers::manual::ManualClock) -- software clock
//!   advanced by hand.
//!
//! [`TimerSystem`]: super::TimerSystem

use super::timeout::Ticks;
use crate::error::KernelResult;

/// Hardware timer abstraction consumed by the timeout core.
pub trait ClockDriver: Send + Sync {
    /// Configure the counter and start it.
    fn init(&self) -> KernelResult<()>;

    /// Arrange for an interrupt no later than `ticks` ticks from now.
    ///
    /// `0` means "as soon as possible" subject to the driver's minimum
    /// programmable delay. [`TICKS_FOREVER`](super::timeout::TICKS_FOREVER)
    /// means no deadline is pending. `idle` is set when the CPU is about to
    /// wait for interrupts; with tickless idle configured, a driver may then
    /// stop counting until [`idle_exit`](Self::idle_exit).
    fn set_timeout(&self, ticks: Ticks, idle: bool);

    /// Whole ticks elapsed since the last announcement that the core has
    /// not been told about yet. Fixed-tick drivers may always return 0.
    fn elapsed(&self) -> Ticks;

    /// Acknowledge a timer interrupt and return the whole ticks to
    /// announce for it: always 1 in fixed-tick mode, the measured count in
    /// tickless mode.
    fn on_interrupt(&self) -> Ticks;

    /// Low 32 bits of the free-running hardware cycle count.
    fn cycle_get_32(&self) -> u32 {
        0
    }

    /// Resume counting after an idle period that stopped the counter.
    fn idle_exit(&self) {}
}

impl<D: ClockDriver + ?Sized> ClockDriver for &D {
    fn init(&self) -> KernelResult<()> {
        (**self).init()
    }

    fn set_timeout(&self, ticks: Ticks, idle: bool) {
        (**self).set_timeout(ticks, idle)
    }

    fn elapsed(&self) -> Ticks {
        (**self).elapsed()
    }

    fn on_interrupt(&self) -> Ticks {
        (**self).on_interrupt()
    }

    fn cycle_get_32(&self) -> u32 {
        (**self).cycle_get_32()
    }

    fn idle_exit(&self) {
        (**self).idle_exit()
    }
}
