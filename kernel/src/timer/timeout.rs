//! Timeout values and entry handles.

use core::fmt;

use super::config::ClockConfig;

/// Signed tick count, the unit every queue delta and driver request uses.
pub type Ticks = i64;

/// "No deadline" sentinel for tick-valued results such as
/// [`TimerSystem::next_timeout_expiry`](super::TimerSystem::next_timeout_expiry)
/// and [`ClockDriver::set_timeout`](super::driver::ClockDriver::set_timeout).
///
/// It is the largest representable count, so ordinary `min` / `<`
/// comparisons against it behave as "infinitely far away".
pub const TICKS_FOREVER: Ticks = Ticks::MAX;

/// Raw encoding of [`Timeout::NoWait`].
const RAW_NO_WAIT: i64 = 0;
/// Raw encoding of [`Timeout::Forever`].
const RAW_FOREVER: i64 = -1;
/// Absolute tick `t` is encoded as `RAW_ABS_BASE - t`.
const RAW_ABS_BASE: i64 = -2;

/// Largest absolute tick the raw encoding can carry.
pub const ABS_TICKS_MAX: u64 = i64::MAX as u64 - 1;

/// A requested delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Expire as soon as possible.
    NoWait,
    /// Never expire.
    Forever,
    /// Expire this many ticks from now. Values `<= 0` behave like
    /// [`Timeout::NoWait`].
    Relative(Ticks),
    /// Expire when the tick counter reaches this value.
    Absolute(u64),
}

impl Timeout {
    /// Relative timeout of `ticks` ticks.
    pub const fn ticks(ticks: Ticks) -> Self {
        Self::Relative(ticks)
    }

    /// Absolute timeout at tick `tick`.
    pub const fn at_tick(tick: u64) -> Self {
        Self::Absolute(tick)
    }

    /// Relative timeout of at least `ms` milliseconds.
    pub fn from_ms(ms: u64, config: &ClockConfig) -> Self {
        Self::Relative(saturate(config.ms_to_ticks_ceil64(ms)))
    }

    /// Relative timeout of at least `us` microseconds.
    pub fn from_us(us: u64, config: &ClockConfig) -> Self {
        Self::Relative(saturate(config.us_to_ticks_ceil64(us)))
    }

    /// Relative timeout of at least `ns` nanoseconds.
    pub fn from_ns(ns: u64, config: &ClockConfig) -> Self {
        Self::Relative(saturate(config.ns_to_ticks_ceil64(ns)))
    }

    /// Pack into the single-integer wire form: `0` is no-wait, `-1` is
    /// forever, positive values are relative ticks, and the remaining
    /// negative half carries absolute ticks as `-2 - tick`.
    ///
    /// Panics if an absolute tick exceeds [`ABS_TICKS_MAX`].
    pub fn to_raw(self) -> i64 {
        match self {
            Self::NoWait => RAW_NO_WAIT,
            Self::Forever => RAW_FOREVER,
            Self::Relative(ticks) => ticks.max(RAW_NO_WAIT),
            Self::Absolute(tick) => {
                assert!(tick <= ABS_TICKS_MAX, "absolute tick {} not encodable", tick);
                RAW_ABS_BASE - tick as i64
            }
        }
    }

    /// Unpack the form produced by [`to_raw`](Self::to_raw).
    ///
    /// Only meaningful once: the tick recovered from an absolute encoding
    /// is itself a valid raw value, but decodes as a relative delay.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            RAW_NO_WAIT => Self::NoWait,
            RAW_FOREVER => Self::Forever,
            r if r > 0 => Self::Relative(r),
            r => Self::Absolute((RAW_ABS_BASE - r) as u64),
        }
    }

    pub fn is_forever(self) -> bool {
        self == Self::Forever
    }
}

fn saturate(ticks: u64) -> Ticks {
    Ticks::try_from(ticks).unwrap_or(Ticks::MAX)
}

/// Handle to a timeout entry registered with a
/// [`TimerSystem`](super::TimerSystem).
///
/// The generation makes handles to released slots stale rather than
/// aliasing whatever entry reuses the slot next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl TimeoutId {
    /// Flatten into a single integer for logs and error reports.
    pub fn as_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

impl fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timeout#{}.{}", self.index, self.generation)
    }
}
