//! Software clock driver.
//!
//! Time only moves when [`ManualClock::advance`] is called. Used for host
//! testing and for simulators that drive the kernel clock themselves.

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use log::trace;

use crate::{
    error::{KernelError, KernelResult},
    timer::{driver::ClockDriver, timeout::Ticks},
};

#[derive(Debug, Default)]
pub struct ManualClock {
    /// Ticks advanced but not yet collected by the interrupt path.
    pending: AtomicI64,
    /// Ticks advanced since creation.
    total: AtomicU64,
    last_ticks: AtomicI64,
    last_idle: AtomicBool,
    program_count: AtomicUsize,
    initialized: AtomicBool,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            pending: AtomicI64::new(0),
            total: AtomicU64::new(0),
            last_ticks: AtomicI64::new(0),
            last_idle: AtomicBool::new(false),
            program_count: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Let `ticks` ticks pass. They show up in `elapsed()` until the next
    /// `on_interrupt()` collects them.
    pub fn advance(&self, ticks: Ticks) {
        let ticks = ticks.max(0);
        self.pending.fetch_add(ticks, Ordering::AcqRel);
        self.total.fetch_add(ticks as u64, Ordering::Relaxed);
    }

    /// Most recent `set_timeout` arguments, if any.
    pub fn last_timeout(&self) -> Option<(Ticks, bool)> {
        if self.program_count() == 0 {
            return None;
        }
        Some((
            self.last_ticks.load(Ordering::Acquire),
            self.last_idle.load(Ordering::Acquire),
        ))
    }

    /// Number of `set_timeout` calls so far.
    pub fn program_count(&self) -> usize {
        self.program_count.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl ClockDriver for ManualClock {
    fn init(&self) -> KernelResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(KernelError::AlreadyExists {
                resource: "manual clock",
                id: 0,
            });
        }
        Ok(())
    }

    fn set_timeout(&self, ticks: Ticks, idle: bool) {
        trace!("manual clock: programmed +{} (idle {})", ticks, idle);
        self.last_ticks.store(ticks, Ordering::Release);
        self.last_idle.store(idle, Ordering::Release);
        self.program_count.fetch_add(1, Ordering::AcqRel);
    }

    fn elapsed(&self) -> Ticks {
        self.pending.load(Ordering::Acquire)
    }

    fn on_interrupt(&self) -> Ticks {
        self.pending.swap(0, Ordering::AcqRel)
    }

    fn cycle_get_32(&self) -> u32 {
        self.total.load(Ordering::Relaxed) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_collect() {
        let clock = ManualClock::new();
        clock.advance(3);
        clock.advance(2);
        assert_eq!(clock.elapsed(), 5);
        assert_eq!(clock.on_interrupt(), 5);
        assert_eq!(clock.elapsed(), 0);
        assert_eq!(clock.cycle_get_32(), 5);
    }

    #[test]
    fn test_records_programming() {
        let clock = ManualClock::new();
        assert_eq!(clock.last_timeout(), None);
        clock.set_timeout(7, false);
        clock.set_timeout(9, true);
        assert_eq!(clock.last_timeout(), Some((9, true)));
        assert_eq!(clock.program_count(), 2);
    }
}
