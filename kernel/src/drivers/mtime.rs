//! RISC-V machine timer (`mtime`/`mtimecmp`) clock driver.
//!
//! `mtime` is a free-running 64-bit up-counter and the timer interrupt is
//! pending while `mtime >= mtimecmp`. Both registers are exposed as pairs of
//! 32-bit words that the hardware does not latch, so reads retry until the
//! high word is stable and comparator writes park the high word at all-ones
//! while the low word changes.
//!
//! `last_count` is the counter value at the last announced tick boundary;
//! everything the driver reports is measured from there.

use log::{debug, trace};

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
    timer::{
        config::{ClockConfig, ClockFlags},
        driver::ClockDriver,
        timeout::{Ticks, TICKS_FOREVER},
    },
};

/// Comparator deadlines closer than this many cycles are pushed out a tick.
pub const MIN_DELAY: u64 = 1000;

/// Register access for one hart's machine timer.
pub trait MtimeRegisters: Send + Sync {
    fn mtime_lo(&self) -> u32;
    fn mtime_hi(&self) -> u32;
    fn set_mtimecmp_lo(&self, value: u32);
    fn set_mtimecmp_hi(&self, value: u32);
}

/// Machine timer registers accessed through MMIO (CLINT layout).
#[derive(Debug)]
pub struct MtimeMmio {
    mtime: usize,
    mtimecmp: usize,
}

impl MtimeMmio {
    /// # Safety
    ///
    /// `mtime` and `mtimecmp` must each address a mapped 64-bit machine
    /// timer register for the lifetime of the returned value, and this
    /// value must be the only writer of `mtimecmp`.
    pub const unsafe fn new(mtime: usize, mtimecmp: usize) -> Self {
        Self { mtime, mtimecmp }
    }
}

impl MtimeRegisters for MtimeMmio {
    fn mtime_lo(&self) -> u32 {
        // SAFETY: `new` requires `mtime` to map the 64-bit counter.
        unsafe { core::ptr::read_volatile(self.mtime as *const u32) }
    }

    fn mtime_hi(&self) -> u32 {
        // SAFETY: Upper word of the counter mapped per `new`.
        unsafe { core::ptr::read_volatile((self.mtime + 4) as *const u32) }
    }

    fn set_mtimecmp_lo(&self, value: u32) {
        // SAFETY: `new` requires `mtimecmp` to map the comparator.
        unsafe { core::ptr::write_volatile(self.mtimecmp as *mut u32, value) }
    }

    fn set_mtimecmp_hi(&self, value: u32) {
        // SAFETY: Upper word of the comparator mapped per `new`.
        unsafe { core::ptr::write_volatile((self.mtimecmp + 4) as *mut u32, value) }
    }
}

#[derive(Debug)]
struct MtimeState {
    last_count: u64,
    /// Comparator value of the last programmed deadline, kept for skew
    /// compensation. `None` once that interrupt has been taken.
    expect_expire: Option<u64>,
}

/// Tickless driver for the RISC-V machine timer.
pub struct MtimeDriver<R> {
    regs: R,
    cyc_per_tick: u64,
    max_ticks: Ticks,
    tickless: bool,
    skew_compensation: bool,
    state: SpinLock<MtimeState>,
}

impl<R: MtimeRegisters> MtimeDriver<R> {
    pub fn new(regs: R, config: &ClockConfig) -> KernelResult<Self> {
        config.validate()?;
        let cyc_per_tick = config.cyc_per_tick();
        if cyc_per_tick > u32::MAX / 2 {
            return Err(KernelError::InvalidArgument {
                name: "ticks_per_sec",
                value: "tick period exceeds 32-bit cycle arithmetic",
            });
        }

        Ok(Self {
            regs,
            cyc_per_tick: u64::from(cyc_per_tick),
            max_ticks: Ticks::from((u32::MAX - cyc_per_tick) / cyc_per_tick),
            tickless: config.is_tickless(),
            skew_compensation: config.flags.contains(ClockFlags::TICK_SKEW_COMPENSATION),
            state: SpinLock::new(MtimeState {
                last_count: 0,
                expect_expire: None,
            }),
        })
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn max_ticks(&self) -> Ticks {
        self.max_ticks
    }

    /// Read the 64-bit counter, retrying across a carry into the high word.
    pub fn mtime(&self) -> u64 {
        loop {
            let hi = self.regs.mtime_hi();
            let lo = self.regs.mtime_lo();
            if self.regs.mtime_hi() == hi {
                return (u64::from(hi) << 32) | u64::from(lo);
            }
        }
    }

    fn set_mtimecmp(&self, time: u64) {
        self.regs.set_mtimecmp_hi(u32::MAX);
        self.regs.set_mtimecmp_lo(time as u32);
        self.regs.set_mtimecmp_hi((time >> 32) as u32);
    }
}

impl<R: MtimeRegisters> ClockDriver for MtimeDriver<R> {
    fn init(&self) -> KernelResult<()> {
        let _state = self.state.lock();
        self.set_mtimecmp(self.mtime().wrapping_add(self.cyc_per_tick));
        debug!("mtime: {} cycles/tick, max {} ticks", self.cyc_per_tick, self.max_ticks);
        Ok(())
    }

    fn set_timeout(&self, ticks: Ticks, idle: bool) {
        // The comparator already holds the deadline the kernel computed;
        // re-rounding it here would keep pushing it a tick out.
        if !self.tickless || idle {
            return;
        }

        let ticks = if ticks == TICKS_FOREVER {
            self.max_ticks
        } else {
            ticks
        };
        let ticks = ticks.saturating_sub(1).clamp(0, self.max_ticks) as u64;
        let cyc_per_tick = self.cyc_per_tick;

        let mut state = self.state.lock();
        let now = self.mtime();

        // Round up to the next tick boundary after `now`.
        let since = now.wrapping_sub(state.last_count);
        let mut cyc = (ticks * cyc_per_tick + since).div_ceil(cyc_per_tick) * cyc_per_tick;
        let deadline = state.last_count.wrapping_add(cyc);
        if (deadline.wrapping_sub(now) as i64) < MIN_DELAY as i64 {
            cyc += cyc_per_tick;
        }

        let deadline = state.last_count.wrapping_add(cyc);
        state.expect_expire = Some(deadline);
        self.set_mtimecmp(deadline);
        trace!("mtime: +{} ticks -> mtimecmp {:#x}", ticks + 1, deadline);
    }

    fn elapsed(&self) -> Ticks {
        if !self.tickless {
            return 0;
        }

        let state = self.state.lock();
        let since = self.mtime().wrapping_sub(state.last_count);
        (since / self.cyc_per_tick) as Ticks
    }

    fn on_interrupt(&self) -> Ticks {
        let cyc_per_tick = self.cyc_per_tick;
        let mut state = self.state.lock();
        let now = self.mtime();

        // Emulated harts can see interrupts arrive long after the deadline
        // when the host deschedules them. Count anything later than half a
        // tick early as on time and slide the reference instead.
        if self.skew_compensation {
            if let Some(expected) = state.expect_expire {
                if now.wrapping_sub(expected) as i64 > -((cyc_per_tick / 2) as i64) {
                    let programmed = expected.wrapping_sub(state.last_count);
                    state.last_count = now.wrapping_sub(programmed);
                    state.expect_expire = None;
                }
            }
        }

        let dticks = now.wrapping_sub(state.last_count) / cyc_per_tick;
        state.last_count = state.last_count.wrapping_add(dticks * cyc_per_tick);

        if !self.tickless {
            let mut next = state.last_count.wrapping_add(cyc_per_tick);
            if (next.wrapping_sub(now) as i64) < MIN_DELAY as i64 {
                next = next.wrapping_add(cyc_per_tick);
            }
            self.set_mtimecmp(next);
            return 1;
        }
        dticks as Ticks
    }

    fn cycle_get_32(&self) -> u32 {
        self.mtime() as u32
    }
}
