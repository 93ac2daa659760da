//! ARM Cortex-M SysTick clock driver.
//!
//! SysTick is a 24-bit down-counter. It reloads from LOAD when it reaches
//! zero, raises its interrupt, and sets COUNTFLAG in the control register.
//! COUNTFLAG clears when the control register is read, so every read goes
//! through [`SysTickDriver::read_ctrl`], which ORs the value into a cache
//! until the interrupt handler consumes it.
//!
//! In tickless mode the counter runs with a LOAD of up to
//! [`SysTickDriver::max_ticks`] ticks and the driver keeps a 32-bit running
//! cycle count: `cycle_count` advances by the active LOAD on every wrap
//! (and is resynchronised whenever LOAD is rewritten), and
//! `announced_cycles` trails it by whatever has not been announced yet.
//! In fixed-tick mode LOAD is exactly one tick and every interrupt
//! announces one tick.

use core::sync::atomic::{compiler_fence, Ordering};

use bitflags::bitflags;
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

/// Largest value the 24-bit counter holds.
pub const COUNTER_MAX: u32 = 0x00ff_ffff;

/// Never program a reload shorter than this many cycles.
pub const MIN_DELAY: u32 = 512;

bitflags! {
    /// SysTick control and status register (SYST_CSR).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SysTickCtrl: u32 {
        const ENABLE = 1 << 0;
        const TICKINT = 1 << 1;
        const CLKSOURCE = 1 << 2;
        /// Counter reached zero since the last read. Read-only, clears on
        /// read.
        const COUNTFLAG = 1 << 16;
    }
}

/// Register access for one SysTick block.
pub trait SysTickRegisters: Send + Sync {
    /// Read SYST_CSR. Clears COUNTFLAG.
    fn ctrl(&self) -> u32;
    fn set_ctrl(&self, value: u32);
    fn load(&self) -> u32;
    fn set_load(&self, value: u32);
    fn val(&self) -> u32;
    /// Write SYST_CVR. The counter restarts from LOAD on its next cycle.
    fn clear_val(&self);
}

// ---------------------------------------------------------------------------
// Memory-mapped registers
// ---------------------------------------------------------------------------

const SYST_CSR: usize = 0x0;
const SYST_RVR: usize = 0x4;
const SYST_CVR: usize = 0x8;

/// SysTick registers accessed through MMIO.
#[derive(Debug)]
pub struct SysTickMmio {
    base: usize,
}

impl SysTickMmio {
    /// Architectural SysTick address on every Cortex-M core.
    pub const CORTEX_M_BASE: usize = 0xE000_E010;

    /// # Safety
    ///
    /// `base` must be the address of a SysTick register block (CSR, RVR,
    /// CVR as consecutive 32-bit words) that stays mapped for the lifetime
    /// of the returned value, and nothing else may program that block.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: `new` requires `base` to map a live SysTick block, and
        // every offset used here lies inside it.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // SAFETY: See `read_reg`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl SysTickRegisters for SysTickMmio {
    fn ctrl(&self) -> u32 {
        self.read_reg(SYST_CSR)
    }

    fn set_ctrl(&self, value: u32) {
        self.write_reg(SYST_CSR, value);
    }

    fn load(&self) -> u32 {
        self.read_reg(SYST_RVR)
    }

    fn set_load(&self, value: u32) {
        self.write_reg(SYST_RVR, value & COUNTER_MAX);
    }

    fn val(&self) -> u32 {
        self.read_reg(SYST_CVR)
    }

    fn clear_val(&self) {
        self.write_reg(SYST_CVR, 0);
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SysTickState {
    /// Value most recently placed in LOAD.
    last_load: u32,
    /// Cycles counted up to the last reload.
    cycle_count: u32,
    /// Cycles already converted into announced ticks.
    announced_cycles: u32,
    /// Accumulated CTRL reads since the last overflow was consumed.
    ctrl_cache: u32,
    /// Counter halted for idle.
    stopped: bool,
}

/// Tickless SysTick driver.
pub struct SysTickDriver<R> {
    regs: R,
    cyc_per_tick: u32,
    max_ticks: u32,
    tickless: bool,
    idle_stop: bool,
    state: SpinLock<SysTickState>,
}

impl<R: SysTickRegisters> SysTickDriver<R> {
    pub fn new(regs: R, config: &ClockConfig) -> KernelResult<Self> {
        config.validate()?;
        let cyc_per_tick = config.cyc_per_tick();
        if COUNTER_MAX / cyc_per_tick < 2 {
            return Err(KernelError::InvalidArgument {
                name: "ticks_per_sec",
                value: "tick period exceeds the 24-bit SysTick counter",
            });
        }

        Ok(Self {
            regs,
            cyc_per_tick,
            max_ticks: COUNTER_MAX / cyc_per_tick - 1,
            tickless: config.is_tickless(),
            idle_stop: config.flags.contains(ClockFlags::TICKLESS_IDLE),
            state: SpinLock::new(SysTickState {
                last_load: 0,
                cycle_count: 0,
                announced_cycles: 0,
                ctrl_cache: 0,
                stopped: false,
            }),
        })
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// Longest timeout one reload can cover.
    pub fn max_ticks(&self) -> Ticks {
        Ticks::from(self.max_ticks)
    }

    fn max_cycles(&self) -> u32 {
        self.max_ticks * self.cyc_per_tick
    }

    /// Read CTRL, keeping a COUNTFLAG the read clears.
    fn read_ctrl(&self, state: &mut SysTickState) -> SysTickCtrl {
        let ctrl = self.regs.ctrl();
        state.ctrl_cache |= ctrl;
        SysTickCtrl::from_bits_retain(ctrl)
    }

    fn reset_overflow(&self, state: &mut SysTickState) {
        self.regs.ctrl();
        state.ctrl_cache = 0;
    }

    /// Cycles counted since the last reload, and the VAL sample they were
    /// derived from.
    fn sample(&self, state: &mut SysTickState) -> (u32, u32) {
        self.read_ctrl(state);
        let mut val = self.regs.val() & COUNTER_MAX;
        if state.ctrl_cache & SysTickCtrl::COUNTFLAG.bits() == 0
            && self.read_ctrl(state).contains(SysTickCtrl::COUNTFLAG)
        {
            // Wrapped between the two reads; VAL is from before the reload.
            val = self.regs.val() & COUNTER_MAX;
        }

        let mut cycles = state.last_load.wrapping_sub(val) & COUNTER_MAX;
        if state.ctrl_cache & SysTickCtrl::COUNTFLAG.bits() != 0 {
            cycles = cycles.wrapping_add(state.last_load);
        }
        (cycles, val)
    }

    fn resume(&self, state: &mut SysTickState) {
        let ctrl = self.read_ctrl(state);
        self.regs
            .set_ctrl((ctrl.difference(SysTickCtrl::COUNTFLAG) | SysTickCtrl::ENABLE).bits());
        state.stopped = false;
        debug!("systick: counter resumed");
    }
}

impl<R: SysTickRegisters> ClockDriver for SysTickDriver<R> {
    fn init(&self) -> KernelResult<()> {
        let mut state = self.state.lock();
        let ctrl = self.read_ctrl(&mut state);

        state.last_load = if self.tickless {
            self.max_cycles()
        } else {
            self.cyc_per_tick
        };
        self.regs.set_load(state.last_load);
        // SysTick is optional on ARMv6-M/ARMv8-M Baseline; an absent
        // block reads as zero.
        let readback = self.regs.load();
        if readback != state.last_load {
            return Err(KernelError::HardwareError {
                device: "systick",
                code: readback,
            });
        }
        self.regs.clear_val();
        state.ctrl_cache = 0;
        state.stopped = false;

        let enable = SysTickCtrl::ENABLE | SysTickCtrl::TICKINT | SysTickCtrl::CLKSOURCE;
        self.regs
            .set_ctrl((ctrl.difference(SysTickCtrl::COUNTFLAG) | enable).bits());

        debug!(
            "systick: {} cycles/tick, reload {} cycles",
            self.cyc_per_tick, state.last_load
        );
        Ok(())
    }

    fn set_timeout(&self, ticks: Ticks, idle: bool) {
        // A 24-bit counter wraps too quickly to sleep through on its own, so
        // the only long idle available is stopping it.
        if self.idle_stop && idle && ticks == TICKS_FOREVER {
            let mut state = self.state.lock();
            let ctrl = self.read_ctrl(&mut state);
            self.regs.set_ctrl(
                ctrl.difference(SysTickCtrl::COUNTFLAG | SysTickCtrl::ENABLE)
                    .bits(),
            );
            state.stopped = true;
            debug!("systick: counter stopped for idle");
            return;
        }

        if !self.tickless {
            return;
        }

        let ticks = ticks.clamp(1, Ticks::from(self.max_ticks)) as u32;
        let cyc = u64::from(self.cyc_per_tick);

        let mut state = self.state.lock();
        if state.stopped {
            self.resume(&mut state);
        }

        let (elapsed, val0) = self.sample(&mut state);
        let now = state.cycle_count.wrapping_add(elapsed);

        // Round the deadline, taken from the last announcement, up to a
        // tick boundary; then express it from now again.
        let since = u64::from(now.wrapping_sub(state.announced_cycles));
        let target = (u64::from(ticks) * cyc + since).div_ceil(cyc) * cyc;
        let mut load = (target - since) as u32;
        while load < MIN_DELAY {
            load += self.cyc_per_tick;
        }

        let previous_load = state.last_load;
        self.reset_overflow(&mut state);
        state.cycle_count = now;

        compiler_fence(Ordering::SeqCst);
        let val1 = self.regs.val() & COUNTER_MAX;
        self.regs.set_load(load);
        self.regs.clear_val();
        compiler_fence(Ordering::SeqCst);

        // Cycles that ran between sampling `now` and the reload.
        let lost = if val0 >= val1 {
            val0 - val1
        } else {
            previous_load.wrapping_sub(val1 - val0)
        };
        state.cycle_count = state.cycle_count.wrapping_add(lost);
        state.last_load = load;

        trace!("systick: +{} ticks -> reload {} (lost {})", ticks, load, lost);
    }

    fn elapsed(&self) -> Ticks {
        if !self.tickless {
            return 0;
        }

        let mut state = self.state.lock();
        let (cycles, _) = self.sample(&mut state);
        let unannounced = state
            .cycle_count
            .wrapping_add(cycles)
            .wrapping_sub(state.announced_cycles);
        Ticks::from(unannounced / self.cyc_per_tick)
    }

    fn on_interrupt(&self) -> Ticks {
        let mut state = self.state.lock();
        state.cycle_count = state.cycle_count.wrapping_add(state.last_load);
        let dticks = state.cycle_count.wrapping_sub(state.announced_cycles) / self.cyc_per_tick;
        state.announced_cycles = state
            .announced_cycles
            .wrapping_add(dticks * self.cyc_per_tick);
        self.reset_overflow(&mut state);
        drop(state);

        if self.tickless {
            Ticks::from(dticks)
        } else {
            1
        }
    }

    fn cycle_get_32(&self) -> u32 {
        let mut state = self.state.lock();
        let (cycles, _) = self.sample(&mut state);
        state.cycle_count.wrapping_add(cycles)
    }

    fn idle_exit(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            self.resume(&mut state);
        }
    }
}
