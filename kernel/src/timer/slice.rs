//! Cooperative time-slice budget.
//!
//! The scheduler decides *whether* the running thread is sliced; this
//! module only counts ticks against the budget and says when it ran out.
//! It borrows the timeout machinery's hardware deadline: while a budget is
//! active, the next programmed interrupt is never later than the end of the
//! slice.

use core::sync::atomic::{AtomicI64, Ordering};

use super::timeout::Ticks;

/// Slice length and what is left of the current slice.
#[derive(Debug, Default)]
pub struct TimeSlice {
    duration: AtomicI64,
    remaining: AtomicI64,
}

impl TimeSlice {
    pub const fn new() -> Self {
        Self {
            duration: AtomicI64::new(0),
            remaining: AtomicI64::new(0),
        }
    }

    /// Set the slice length and start a fresh slice. `0` disables slicing.
    pub fn set(&self, ticks: Ticks) {
        let ticks = ticks.max(0);
        self.duration.store(ticks, Ordering::Relaxed);
        self.remaining.store(ticks, Ordering::Relaxed);
    }

    /// Start a fresh slice of the configured length.
    pub fn reset(&self) {
        self.remaining
            .store(self.duration.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn duration(&self) -> Ticks {
        self.duration.load(Ordering::Relaxed)
    }

    /// Ticks left in the current slice, or `None` when slicing is off.
    pub fn remaining(&self) -> Option<Ticks> {
        match self.remaining.load(Ordering::Relaxed) {
            0 => None,
            ticks => Some(ticks),
        }
    }

    /// Charge `ticks` against the budget. Returns `true` when the slice is
    /// used up; the budget is then reloaded for the next thread.
    ///
    /// Only the announce path calls this, so the load/store pair does not
    /// race with itself.
    pub fn consume(&self, ticks: Ticks) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining == 0 || ticks <= 0 {
            return false;
        }
        if ticks >= remaining {
            self.reset();
            true
        } else {
            self.remaining.store(remaining - ticks, Ordering::Relaxed);
            false
        }
    }
}
