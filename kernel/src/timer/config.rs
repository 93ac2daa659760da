//! Clock configuration.
//!
//! Mirrors the knobs a kernel build would normally fix in its board
//! configuration: the hardware counter rate, the kernel tick rate, and the
//! mode switches that change how the timeout core and the drivers behave.

use bitflags::bitflags;

use crate::{
    error::{KernelError, KernelResult},
    kernel_error,
};

use super::timeout::{Ticks, TICKS_FOREVER};

/// Default number of timeout slots a [`TimerSystem`](super::TimerSystem)
/// reserves up front.
pub const DEFAULT_MAX_TIMEOUTS: usize = 64;

bitflags! {
    /// Mode switches for the timing core and clock drivers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClockFlags: u32 {
        /// Program the hardware for the next real deadline instead of
        /// taking an interrupt every tick.
        const TICKLESS_KERNEL = 1 << 0;
        /// Allow drivers to stop the counter while the CPU idles with no
        /// deadline pending.
        const TICKLESS_IDLE = 1 << 1;
        /// Permit tick announcements to be missed in idle; "no timeout"
        /// becomes a true forever instead of `i32::MAX` ticks.
        const SLOPPY_IDLE = 1 << 2;
        /// Let the cooperative time-slice budget shorten the next deadline.
        const TIMESLICING = 1 << 3;
        /// Treat interrupts that arrive late (emulators descheduled by the
        /// host) as on time and skew the driver's reference forward.
        const TICK_SKEW_COMPENSATION = 1 << 4;
    }
}

/// Clock rates, capacity and mode flags for one timer system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    /// Hardware counter frequency in Hz.
    pub hw_cycles_per_sec: u32,
    /// Kernel tick rate in Hz.
    pub ticks_per_sec: u32,
    pub flags: ClockFlags,
    /// Number of timeout slots reserved at construction.
    pub max_timeouts: usize,
    /// `hw_cycles_per_sec` was sampled from hardware at boot, so cycle
    /// conversions cannot rely on it dividing evenly.
    pub runtime_frequency: bool,
}

impl ClockConfig {
    /// Tickless configuration with idle stop and time slicing enabled.
    pub const fn new(hw_cycles_per_sec: u32, ticks_per_sec: u32) -> Self {
        Self {
            hw_cycles_per_sec,
            ticks_per_sec,
            flags: ClockFlags::TICKLESS_KERNEL
                .union(ClockFlags::TICKLESS_IDLE)
                .union(ClockFlags::TIMESLICING),
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
            runtime_frequency: false,
        }
    }

    /// Fixed-tick configuration: one interrupt per tick.
    pub const fn ticked(hw_cycles_per_sec: u32, ticks_per_sec: u32) -> Self {
        Self {
            hw_cycles_per_sec,
            ticks_per_sec,
            flags: ClockFlags::TIMESLICING,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
            runtime_frequency: false,
        }
    }

    pub const fn with_flags(mut self, flags: ClockFlags) -> Self {
        self.flags = flags;
        self
    }

    pub const fn with_max_timeouts(mut self, max_timeouts: usize) -> Self {
        self.max_timeouts = max_timeouts;
        self
    }

    /// Replace the counter rate with one measured at boot.
    pub const fn with_runtime_frequency(mut self, hw_cycles_per_sec: u32) -> Self {
        self.hw_cycles_per_sec = hw_cycles_per_sec;
        self.runtime_frequency = true;
        self
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> KernelResult<()> {
        if self.ticks_per_sec == 0 {
            return Err(kernel_error!(InvalidArgument { "ticks_per_sec" => "must be > 0" }));
        }
        if self.hw_cycles_per_sec == 0 {
            return Err(kernel_error!(InvalidArgument { "hw_cycles_per_sec" => "must be > 0" }));
        }
        if self.hw_cycles_per_sec < self.ticks_per_sec {
            return Err(KernelError::InvalidArgument {
                name: "ticks_per_sec",
                value: "must not exceed hw_cycles_per_sec",
            });
        }
        if self.max_timeouts == 0 || self.max_timeouts > u32::MAX as usize {
            return Err(KernelError::InvalidArgument {
                name: "max_timeouts",
                value: "must be in 1..=u32::MAX",
            });
        }
        Ok(())
    }

    pub fn is_tickless(&self) -> bool {
        self.flags.contains(ClockFlags::TICKLESS_KERNEL)
    }

    /// Whole hardware cycles per kernel tick.
    pub fn cyc_per_tick(&self) -> u32 {
        self.hw_cycles_per_sec / self.ticks_per_sec
    }

    /// Longest wait the core hands to a driver when nothing is queued.
    pub fn max_wait(&self) -> Ticks {
        if self.flags.contains(ClockFlags::SLOPPY_IDLE) {
            TICKS_FOREVER
        } else {
            Ticks::from(i32::MAX)
        }
    }
}
