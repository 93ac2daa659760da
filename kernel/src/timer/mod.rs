//! Tickless timeout management.
//!
//! This module owns every pending time-based wakeup in the kernel. Pending
//! entries live in a delta-encoded [`TimeoutQueue`] behind a single
//! [`SpinLock`]; the hardware timer's interrupt handler drives
//! [`TimerSystem::announce`], which advances the 64-bit tick base and fires
//! whatever has come due; and the driver is reprogrammed for the next real
//! deadline instead of interrupting every tick.
//!
//! # Usage
//!
//! ```ignore
//! let system = TimerSystem::new(driver, ClockConfig::new(HW_HZ, 100))?;
//! system.init()?;
//!
//! // Register an entry once, then arm it as often as needed.
//! let id = system.create_timeout(|sys, id| wake_sleeper(sys, id))?;
//! system.add_timeout(id, Timeout::from_ms(20, system.config()));
//!
//! // Cancelling an entry that already fired is not an error.
//! let removed = system.abort_timeout(id);
//!
//! // From the timer interrupt handler.
//! let summary = system.timer_isr();
//! if summary.slice_expired {
//!     reschedule();
//! }
//! ```
//!
//! # Time bases
//!
//! `curr_tick` only moves inside [`announce`](TimerSystem::announce). Ticks
//! the hardware has counted since then are obtained from the driver on
//! demand ([`ClockDriver::elapsed`]) and every queued delta is relative to
//! `curr_tick`, so "now" is always `curr_tick + elapsed`. While an announce
//! is unwinding the queue the driver's count has already been consumed,
//! and elapsed is reported as 0 so nothing is counted twice.

pub mod config;
pub mod driver;
pub mod queue;
pub mod slice;
pub mod timeout;
pub mod units;

use alloc::boxed::Box;

use log::{debug, trace, warn};

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
};

use self::{
    config::{ClockConfig, ClockFlags},
    driver::ClockDriver,
    queue::TimeoutQueue,
    slice::TimeSlice,
    timeout::{Ticks, Timeout, TimeoutId, TICKS_FOREVER},
};

/// Expiry callback.
///
/// Runs with the timeout lock released, exactly once per expiry, and may
/// freely add or abort timeouts (including re-arming its own entry).
pub type TimeoutFn<D> = Box<dyn FnMut(&TimerSystem<D>, TimeoutId) + Send>;

/// Result of one [`TimerSystem::announce`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceSummary {
    /// Entries that expired during this announce.
    pub fired: usize,
    /// The cooperative time slice ran out; the scheduler should rotate.
    pub slice_expired: bool,
    /// Ticks until the deadline the driver was reprogrammed with.
    pub next_timeout: Ticks,
}

/// Everything the timeout lock protects.
struct TimeoutState<D> {
    queue: TimeoutQueue<TimeoutFn<D>>,
    /// Ticks announced since boot.
    curr_tick: u64,
    /// Ticks of the running announce not yet charged to the queue.
    announce_remaining: Ticks,
    announcing: bool,
}

/// Timeout queue, tick base and driver of one hardware timer.
///
/// Usually a kernel has exactly one, owned by its top-level context;
/// independent instances are fully isolated from one another.
pub struct TimerSystem<D> {
    driver: D,
    config: ClockConfig,
    state: SpinLock<TimeoutState<D>>,
    slice: TimeSlice,
}

impl<D: ClockDriver> TimerSystem<D> {
    /// Validate `config` and reserve its timeout slots.
    ///
    /// The driver is not touched until [`init`](Self::init).
    pub fn new(driver: D, config: ClockConfig) -> KernelResult<Self> {
        config.validate()?;
        debug!(
            "timer: {} Hz counter, {} ticks/s, {} slots, flags {:?}",
            config.hw_cycles_per_sec, config.ticks_per_sec, config.max_timeouts, config.flags
        );

        Ok(Self {
            driver,
            config,
            state: SpinLock::new(TimeoutState {
                queue: TimeoutQueue::with_capacity(config.max_timeouts),
                curr_tick: 0,
                announce_remaining: 0,
                announcing: false,
            }),
            slice: TimeSlice::new(),
        })
    }

    /// Start the hardware counter.
    pub fn init(&self) -> KernelResult<()> {
        self.driver.init()?;
        debug!("timer: clock driver started");
        Ok(())
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Entry lifecycle
    // -----------------------------------------------------------------------

    /// Register a timeout entry bound to `callback`. The entry starts
    /// unqueued.
    pub fn create_timeout<F>(&self, callback: F) -> KernelResult<TimeoutId>
    where
        F: FnMut(&TimerSystem<D>, TimeoutId) + Send + 'static,
    {
        let callback: TimeoutFn<D> = Box::new(callback);
        self.state
            .lock()
            .queue
            .allocate(callback)
            .ok_or(KernelError::ResourceExhausted {
                resource: "timeout slots",
            })
    }

    /// Free an entry's slot. Returns `false` for a stale handle.
    ///
    /// The entry must not be queued: abort it first.
    pub fn release_timeout(&self, id: TimeoutId) -> bool {
        let released = self.state.lock().queue.release(id);
        // The callback is dropped here, outside the lock.
        released.is_some()
    }

    // -----------------------------------------------------------------------
    // Queue operations
    // -----------------------------------------------------------------------

    /// Queue `id` to expire after `timeout`.
    ///
    /// Relative timeouts requested outside an announce get one extra tick:
    /// part of the current tick may already be gone, and expiring early is
    /// never acceptable. Inside an announce (expiry callbacks) the clock is
    /// exactly on a tick boundary and the count is used as is. Every delta
    /// is at least one tick. [`Timeout::Forever`] leaves the entry unqueued.
    ///
    /// Panics if `id` is stale or already queued.
    pub fn add_timeout(&self, id: TimeoutId, timeout: Timeout) {
        if timeout.is_forever() {
            trace!("timer: {} not queued, timeout is forever", id);
            return;
        }

        let mut state = self.state.lock();
        self.add_locked(&mut state, id, timeout);
    }

    /// Rebind `id` to `callback` and queue it, as one atomic step.
    pub fn add_timeout_with<F>(&self, id: TimeoutId, timeout: Timeout, callback: F) -> KernelResult<()>
    where
        F: FnMut(&TimerSystem<D>, TimeoutId) + Send + 'static,
    {
        let callback: TimeoutFn<D> = Box::new(callback);
        let mut state = self.state.lock();
        let cell = state.queue.payload_mut(id).ok_or(KernelError::NotFound {
            resource: "timeout",
            id: id.as_u64(),
        })?;
        let previous = cell.replace(callback);

        if !timeout.is_forever() {
            self.add_locked(&mut state, id, timeout);
        }
        drop(state);
        drop(previous);
        Ok(())
    }

    fn add_locked(&self, state: &mut TimeoutState<D>, id: TimeoutId, timeout: Timeout) {
        let dticks = match timeout {
            Timeout::Absolute(tick) => {
                if tick <= state.curr_tick {
                    warn!(
                        "timer: {} absolute deadline {} already passed (now {})",
                        id, tick, state.curr_tick
                    );
                }
                let ahead = tick.saturating_sub(state.curr_tick);
                Ticks::try_from(ahead).unwrap_or(Ticks::MAX).max(1)
            }
            Timeout::Relative(ticks) => self.relative_delta(state, ticks),
            Timeout::NoWait | Timeout::Forever => self.relative_delta(state, 0),
        };

        state.queue.insert(id, dticks);
        trace!("timer: queued {} at +{} (tick {})", id, dticks, state.curr_tick);

        if state.queue.first() == Some(id) {
            let next = self.next_timeout(state);
            self.driver.set_timeout(next, false);
        }
    }

    /// Take `id` off the queue. `false` means it was not queued (already
    /// fired, aborted, or never added); its callback will not run for a
    /// submission this call removed.
    pub fn abort_timeout(&self, id: TimeoutId) -> bool {
        let removed = self.state.lock().queue.remove(id);
        trace!("timer: abort {} -> {}", id, removed);
        removed
    }

    /// Absolute tick at which `id` expires. For an unqueued entry this is
    /// "now".
    pub fn timeout_end(&self, id: TimeoutId) -> u64 {
        let state = self.state.lock();
        match state.queue.end_offset(id) {
            Some(offset) => state.curr_tick + offset as u64,
            None => state.curr_tick + self.elapsed(&state) as u64,
        }
    }

    /// Ticks left until `id` expires; 0 if it is not queued.
    pub fn timeout_remaining(&self, id: TimeoutId) -> Ticks {
        let state = self.state.lock();
        state
            .queue
            .end_offset(id)
            .map_or(0, |offset| (offset - self.elapsed(&state)).max(0))
    }

    /// Ticks until the next deadline the driver should wake for.
    ///
    /// Without pending entries this is the configured maximum wait
    /// ([`TICKS_FOREVER`] under sloppy idle).
    pub fn next_timeout_expiry(&self) -> Ticks {
        let state = self.state.lock();
        self.next_timeout(&state)
    }

    /// Offer the driver a deadline `ticks` from now.
    ///
    /// Applied only if it is sooner than what is already pending and the
    /// pending deadline is not imminent; drivers already push an imminent
    /// deadline out to the next settable tick themselves.
    pub fn set_timeout_expiry(&self, ticks: Ticks, idle: bool) {
        let state = self.state.lock();
        let next = self.next_timeout(&state);
        let sooner = next == TICKS_FOREVER || ticks < next;
        let imminent = next <= 1;

        if sooner && !imminent {
            self.driver.set_timeout(ticks, idle);
        }
    }

    /// Hand the next deadline to the driver ahead of an idle wait.
    ///
    /// Returns the ticks that were programmed.
    pub fn idle_enter(&self) -> Ticks {
        let state = self.state.lock();
        let next = self.next_timeout(&state);
        self.driver.set_timeout(next, true);
        debug!("timer: idle for {} ticks", next);
        next
    }

    /// Restart a counter stopped for idle.
    pub fn idle_exit(&self) {
        self.driver.idle_exit();
    }

    // -----------------------------------------------------------------------
    // Announce
    // -----------------------------------------------------------------------

    /// Interrupt entry: collect newly elapsed ticks from the driver and
    /// announce them.
    pub fn timer_isr(&self) -> AnnounceSummary {
        let ticks = self.driver.on_interrupt();
        self.announce(ticks)
    }

    /// Advance the tick base by `ticks` and fire every entry now due.
    ///
    /// The lock is dropped around each callback and the head re-read
    /// afterwards, since callbacks may add or abort entries; an entry a
    /// callback queues within the ticks still being announced fires in
    /// this same call. Between callbacks other execution units can observe
    /// a partly advanced `curr_tick`.
    ///
    /// Must not run concurrently with itself.
    pub fn announce(&self, ticks: Ticks) -> AnnounceSummary {
        let ticks = ticks.max(0);
        let slice_expired =
            self.config.flags.contains(ClockFlags::TIMESLICING) && self.slice.consume(ticks);

        let mut state = self.state.lock();
        assert!(!state.announcing, "timer announce re-entered");
        state.announce_remaining = ticks;
        state.announcing = true;

        let mut fired = 0;
        while let Some(delta) = state
            .queue
            .first_delta()
            .filter(|&delta| delta <= state.announce_remaining)
        {
            let Some((id, _)) = state.queue.pop_first() else {
                break;
            };
            state.curr_tick += delta as u64;
            state.announce_remaining -= delta;
            fired += 1;

            let callback = state.queue.payload_mut(id).and_then(Option::take);
            drop(state);

            state = match callback {
                Some(mut callback) => {
                    callback(self, id);
                    let mut state = self.state.lock();
                    // Put the callback back unless the entry was released
                    // or rebound while it ran.
                    let stale = match state.queue.payload_mut(id) {
                        Some(cell) if cell.is_none() => {
                            *cell = Some(callback);
                            None
                        }
                        _ => Some(callback),
                    };
                    // Captured state may call back into the timer system
                    // when dropped, so never drop it under the lock.
                    if let Some(stale) = stale {
                        drop(state);
                        drop(stale);
                        state = self.state.lock();
                    }
                    state
                }
                None => self.state.lock(),
            };
        }

        let remaining = state.announce_remaining;
        if let Some(head) = state.queue.first_delta_mut() {
            *head -= remaining;
        }
        state.curr_tick += remaining as u64;
        state.announce_remaining = 0;
        state.announcing = false;

        let next_timeout = self.next_timeout(&state);
        self.driver.set_timeout(next_timeout, false);
        trace!(
            "timer: announced {} ticks, fired {}, now {}, next +{}",
            ticks,
            fired,
            state.curr_tick,
            next_timeout
        );

        AnnounceSummary {
            fired,
            slice_expired,
            next_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // Time base
    // -----------------------------------------------------------------------

    /// Ticks since boot, including ticks the driver has counted but not
    /// yet announced.
    pub fn current_tick(&self) -> u64 {
        let state = self.state.lock();
        state.curr_tick + self.elapsed(&state) as u64
    }

    /// Low 32 bits of the tick count. Fixed-tick kernels report only
    /// announced ticks.
    pub fn current_tick_32(&self) -> u32 {
        if self.config.is_tickless() {
            self.current_tick() as u32
        } else {
            self.state.lock().curr_tick as u32
        }
    }

    /// Milliseconds since boot, rounded down.
    pub fn uptime_ms(&self) -> u64 {
        self.config.ticks_to_ms_floor64(self.current_tick())
    }

    /// Milliseconds since boot derived from the 32-bit tick count.
    pub fn uptime_ms_32(&self) -> u32 {
        self.config
            .ticks_to_ms_floor32(u64::from(self.current_tick_32()))
    }

    /// Low 32 bits of the hardware cycle counter.
    pub fn cycle_get_32(&self) -> u32 {
        self.driver.cycle_get_32()
    }

    // -----------------------------------------------------------------------
    // Time slicing
    // -----------------------------------------------------------------------

    /// Set the cooperative slice length in ticks; `0` turns slicing off.
    pub fn set_time_slice(&self, ticks: Ticks) {
        self.slice.set(ticks);
    }

    /// Give the next thread a full slice.
    pub fn reset_time_slice(&self) {
        self.slice.reset();
    }

    pub fn time_slice(&self) -> &TimeSlice {
        &self.slice
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Number of queued entries.
    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Visit queued entries in expiry order with their stored deltas.
    ///
    /// Runs under the timeout lock: `f` must not call back into the
    /// system.
    pub fn for_each_pending<F: FnMut(TimeoutId, Ticks)>(&self, mut f: F) {
        let state = self.state.lock();
        for (id, delta) in state.queue.iter() {
            f(id, delta);
        }
    }

    /// Whether `id` is currently queued.
    pub fn is_pending(&self, id: TimeoutId) -> bool {
        self.state.lock().queue.is_linked(id)
    }

    // -----------------------------------------------------------------------
    // Internal helpers (timeout lock held)
    // -----------------------------------------------------------------------

    fn elapsed(&self, state: &TimeoutState<D>) -> Ticks {
        if state.announcing {
            0
        } else {
            self.driver.elapsed()
        }
    }

    /// Queue delta for a wait of `ticks` starting now.
    fn relative_delta(&self, state: &TimeoutState<D>, ticks: Ticks) -> Ticks {
        let padding = if state.announcing { 0 } else { 1 };
        ticks
            .max(0)
            .saturating_add(padding)
            .max(1)
            .saturating_add(self.elapsed(state))
    }

    fn next_timeout(&self, state: &TimeoutState<D>) -> Ticks {
        let mut next = match state.queue.first_delta() {
            Some(delta) => (delta - self.elapsed(state)).max(0),
            None => self.config.max_wait(),
        };

        if self.config.flags.contains(ClockFlags::TIMESLICING) {
            if let Some(slice) = self.slice.remaining() {
                next = next.min(slice);
            }
        }
        next
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::*;
    use crate::drivers::manual::ManualClock;

    type System<'a> = TimerSystem<&'a ManualClock>;

    fn config() -> ClockConfig {
        ClockConfig::new(1_000_000, 1_000)
    }

    fn system(clock: &ManualClock) -> System<'_> {
        TimerSystem::new(clock, config()).unwrap()
    }

    fn deltas(sys: &System<'_>) -> Vec<Ticks> {
        let mut out = Vec::new();
        sys.for_each_pending(|_, delta| out.push(delta));
        out
    }

    /// Entry that appends `tag` to `log` when it fires.
    fn recorder(sys: &System<'_>, log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> TimeoutId {
        let log = Arc::clone(log);
        sys.create_timeout(move |_, _| log.lock().unwrap().push(tag))
            .unwrap()
    }

    #[test]
    fn test_relative_add_pads_one_tick_outside_announce() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();

        sys.add_timeout(id, Timeout::ticks(5));
        assert_eq!(deltas(&sys), vec![6]);
        assert_eq!(sys.timeout_remaining(id), 6);
        assert_eq!(clock.last_timeout(), Some((6, false)));
    }

    #[test]
    fn test_no_wait_still_takes_one_tick() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();

        sys.add_timeout(id, Timeout::NoWait);
        assert_eq!(deltas(&sys), vec![1]);
        assert_eq!(sys.announce(0).fired, 0);
        assert_eq!(sys.announce(1).fired, 1);
    }

    #[test]
    fn test_add_accounts_for_unannounced_ticks() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();

        clock.advance(4);
        sys.add_timeout(id, Timeout::ticks(10));
        // Stored relative to the last announce: 4 elapsed + 10 + 1 padding.
        assert_eq!(deltas(&sys), vec![15]);
        assert_eq!(sys.timeout_remaining(id), 11);
        assert_eq!(sys.timeout_end(id), 15);
        assert_eq!(clock.last_timeout(), Some((11, false)));
    }

    #[test]
    fn test_forever_is_not_queued() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();

        sys.add_timeout(id, Timeout::Forever);
        assert!(!sys.is_pending(id));
        assert_eq!(clock.program_count(), 0);
    }

    #[test]
    fn test_absolute_deadlines_are_exact() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&sys, &log, 5);
        let b = recorder(&sys, &log, 3);
        let c = recorder(&sys, &log, 9);

        sys.add_timeout(a, Timeout::at_tick(5));
        assert_eq!(deltas(&sys), vec![5]);
        sys.add_timeout(b, Timeout::at_tick(3));
        assert_eq!(deltas(&sys), vec![3, 2]);
        sys.add_timeout(c, Timeout::at_tick(9));
        assert_eq!(deltas(&sys), vec![3, 2, 4]);

        // Only the two head changes reprogrammed the hardware.
        assert_eq!(clock.program_count(), 2);
        assert_eq!(clock.last_timeout(), Some((3, false)));

        let summary = sys.announce(5);
        assert_eq!(summary.fired, 2);
        assert_eq!(*log.lock().unwrap(), vec![3, 5]);
        assert_eq!(deltas(&sys), vec![4]);
        assert_eq!(sys.current_tick(), 5);
        assert_eq!(summary.next_timeout, 4);
        assert_eq!(clock.last_timeout(), Some((4, false)));
    }

    #[test]
    fn test_past_absolute_deadline_fires_next_tick() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        sys.announce(20);
        let id = sys.create_timeout(|_, _| {}).unwrap();

        sys.add_timeout(id, Timeout::at_tick(3));
        assert_eq!(deltas(&sys), vec![1]);
        assert_eq!(sys.timeout_end(id), 21);
    }

    #[test]
    fn test_callback_added_entry_fires_in_same_announce() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let hits = Arc::new(AtomicUsize::new(0));

        let follow_hits = Arc::clone(&hits);
        let follow = sys
            .create_timeout(move |_, _| {
                follow_hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let first_hits = Arc::clone(&hits);
        let first = sys
            .create_timeout(move |sys, _| {
                first_hits.fetch_add(1, Ordering::SeqCst);
                // Exact inside an announce: due one tick from now.
                sys.add_timeout(follow, Timeout::ticks(1));
                assert_eq!(sys.timeout_remaining(follow), 1);
            })
            .unwrap();

        sys.add_timeout(first, Timeout::at_tick(1));
        let summary = sys.announce(3);
        assert_eq!(summary.fired, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(sys.current_tick(), 3);
        assert_eq!(sys.pending_count(), 0);
    }

    #[test]
    fn test_callback_added_entry_beyond_batch_waits() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let follow = sys.create_timeout(|_, _| {}).unwrap();
        let first = sys
            .create_timeout(move |sys, _| sys.add_timeout(follow, Timeout::ticks(2)))
            .unwrap();

        sys.add_timeout(first, Timeout::at_tick(2));
        assert_eq!(sys.announce(3).fired, 1);
        // Queued at tick 2 + 2; one tick of the batch was left over.
        assert_eq!(deltas(&sys), vec![1]);
        assert_eq!(sys.timeout_end(follow), 4);
    }

    #[test]
    fn test_periodic_rearm_from_callback() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = sys
            .create_timeout(move |sys, id| {
                counter.fetch_add(1, Ordering::SeqCst);
                sys.add_timeout(id, Timeout::ticks(10));
            })
            .unwrap();

        sys.add_timeout(id, Timeout::at_tick(10));
        assert_eq!(sys.announce(35).fired, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(sys.timeout_end(id), 40);
    }

    #[test]
    fn test_abort_prevents_firing() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&sys, &log, 1);
        let b = recorder(&sys, &log, 2);

        sys.add_timeout(a, Timeout::at_tick(4));
        sys.add_timeout(b, Timeout::at_tick(6));
        assert!(sys.abort_timeout(a));
        assert!(!sys.abort_timeout(a));
        // b keeps its absolute deadline.
        assert_eq!(deltas(&sys), vec![6]);

        sys.announce(10);
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert!(!sys.abort_timeout(b));
    }

    #[test]
    fn test_unqueued_entry_reports_now() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();

        sys.announce(7);
        clock.advance(2);
        assert_eq!(sys.timeout_end(id), 9);
        assert_eq!(sys.timeout_remaining(id), 0);
    }

    #[test]
    fn test_elapsed_is_zero_during_announce() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let seen = Arc::new(Mutex::new(None));
        let observed = Arc::clone(&seen);
        let id = sys
            .create_timeout(move |sys, _| {
                *observed.lock().unwrap() = Some(sys.current_tick());
            })
            .unwrap();

        sys.add_timeout(id, Timeout::at_tick(2));
        // The driver still reports 3 unannounced ticks while they are
        // being announced; they must not be counted twice.
        clock.advance(3);
        sys.announce(3);
        assert_eq!(*seen.lock().unwrap(), Some(2));
    }

    #[test]
    fn test_timer_isr_announces_driver_ticks() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();
        sys.add_timeout(id, Timeout::at_tick(4));

        clock.advance(4);
        let summary = sys.timer_isr();
        assert_eq!(summary.fired, 1);
        assert_eq!(sys.current_tick(), 4);
        assert_eq!(clock.elapsed(), 0);
    }

    #[test]
    fn test_next_expiry_subtracts_elapsed_and_floors_at_zero() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        assert_eq!(sys.next_timeout_expiry(), i32::MAX as Ticks);

        let id = sys.create_timeout(|_, _| {}).unwrap();
        sys.add_timeout(id, Timeout::at_tick(10));
        clock.advance(4);
        assert_eq!(sys.next_timeout_expiry(), 6);
        clock.advance(20);
        assert_eq!(sys.next_timeout_expiry(), 0);
    }

    #[test]
    fn test_sloppy_idle_reports_forever() {
        let clock = ManualClock::new();
        let config = config().with_flags(ClockFlags::TICKLESS_KERNEL | ClockFlags::SLOPPY_IDLE);
        let sys = TimerSystem::new(&clock, config).unwrap();

        assert_eq!(sys.next_timeout_expiry(), TICKS_FOREVER);
        assert_eq!(sys.idle_enter(), TICKS_FOREVER);
        assert_eq!(clock.last_timeout(), Some((TICKS_FOREVER, true)));
    }

    #[test]
    fn test_time_slice_caps_next_deadline_and_expires() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();
        sys.add_timeout(id, Timeout::at_tick(10));

        sys.set_time_slice(3);
        assert_eq!(sys.next_timeout_expiry(), 3);
        assert!(!sys.announce(2).slice_expired);
        assert_eq!(sys.next_timeout_expiry(), 1);
        let summary = sys.announce(1);
        assert!(summary.slice_expired);
        assert_eq!(summary.next_timeout, 3);

        sys.set_time_slice(0);
        assert_eq!(sys.next_timeout_expiry(), 7);
    }

    #[test]
    fn test_time_slice_ignored_without_timeslicing() {
        let clock = ManualClock::new();
        let config = config().with_flags(ClockFlags::TICKLESS_KERNEL);
        let sys = TimerSystem::new(&clock, config).unwrap();

        sys.set_time_slice(2);
        assert!(!sys.announce(5).slice_expired);
        assert_eq!(sys.next_timeout_expiry(), i32::MAX as Ticks);
    }

    #[test]
    fn test_set_timeout_expiry_only_when_sooner_and_not_imminent() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();
        sys.add_timeout(id, Timeout::at_tick(10));
        let programmed = clock.program_count();

        sys.set_timeout_expiry(12, false);
        assert_eq!(clock.program_count(), programmed);

        sys.set_timeout_expiry(5, true);
        assert_eq!(clock.program_count(), programmed + 1);
        assert_eq!(clock.last_timeout(), Some((5, true)));

        clock.advance(9);
        sys.set_timeout_expiry(0, false);
        assert_eq!(clock.program_count(), programmed + 1);
    }

    #[test]
    fn test_tick_queries() {
        let clock = ManualClock::new();
        let sys = system(&clock);

        sys.announce(u32::MAX as Ticks + 5);
        assert_eq!(sys.current_tick(), u32::MAX as u64 + 5);
        assert_eq!(sys.current_tick_32(), 4);

        clock.advance(6);
        assert_eq!(sys.current_tick_32(), 10);
        assert_eq!(sys.uptime_ms(), u32::MAX as u64 + 11);
    }

    #[test]
    fn test_ticked_mode_32bit_tick_ignores_elapsed() {
        let clock = ManualClock::new();
        let sys = TimerSystem::new(&clock, ClockConfig::ticked(1_000_000, 100)).unwrap();

        sys.announce(3);
        clock.advance(2);
        assert_eq!(sys.current_tick_32(), 3);
        assert_eq!(sys.uptime_ms_32(), 30);
    }

    #[test]
    fn test_slot_exhaustion() {
        let clock = ManualClock::new();
        let sys = TimerSystem::new(&clock, config().with_max_timeouts(1)).unwrap();

        let id = sys.create_timeout(|_, _| {}).unwrap();
        assert_eq!(
            sys.create_timeout(|_, _| {}),
            Err(KernelError::ResourceExhausted {
                resource: "timeout slots"
            })
        );
        assert!(sys.release_timeout(id));
        assert!(!sys.release_timeout(id));
        assert!(sys.create_timeout(|_, _| {}).is_ok());
    }

    #[test]
    fn test_rebind_callback() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = recorder(&sys, &log, 1);

        let rebound = Arc::clone(&log);
        sys.add_timeout_with(id, Timeout::at_tick(1), move |_, _| {
            rebound.lock().unwrap().push(2)
        })
        .unwrap();
        sys.announce(1);
        assert_eq!(*log.lock().unwrap(), vec![2]);

        assert!(sys.release_timeout(id));
        assert!(matches!(
            sys.add_timeout_with(id, Timeout::ticks(1), |_, _| {}),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn test_callback_may_release_its_own_entry() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys
            .create_timeout(|sys, id| {
                assert!(sys.release_timeout(id));
            })
            .unwrap();

        sys.add_timeout(id, Timeout::at_tick(1));
        assert_eq!(sys.announce(1).fired, 1);
        assert!(!sys.release_timeout(id));
    }

    #[test]
    #[should_panic(expected = "already queued")]
    fn test_re_adding_linked_entry_panics() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();
        sys.add_timeout(id, Timeout::ticks(3));
        sys.add_timeout(id, Timeout::ticks(3));
    }

    #[test]
    #[should_panic(expected = "still queued")]
    fn test_releasing_linked_entry_panics() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys.create_timeout(|_, _| {}).unwrap();
        sys.add_timeout(id, Timeout::ticks(3));
        sys.release_timeout(id);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_reentrant_announce_panics() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        let id = sys
            .create_timeout(|sys, _| {
                sys.announce(1);
            })
            .unwrap();
        sys.add_timeout(id, Timeout::at_tick(1));
        sys.announce(1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = ManualClock::new();
        assert!(TimerSystem::new(&clock, ClockConfig::new(1_000, 0)).is_err());
    }

    #[test]
    fn test_init_starts_driver_once() {
        let clock = ManualClock::new();
        let sys = system(&clock);
        sys.init().unwrap();
        assert!(clock.is_initialized());
        assert!(matches!(
            sys.init(),
            Err(KernelError::AlreadyExists { .. })
        ));
    }
}
