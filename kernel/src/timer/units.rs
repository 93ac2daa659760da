//! Conversions between hardware cycles, ticks and wall units.
//!
//! Every conversion is `(t * to_hz + offset) / from_hz` with the offset
//! chosen by the rounding mode. When one rate is an exact multiple of the
//! other the product collapses to a single multiply or divide, which fits
//! 32-bit arithmetic for 32-bit inputs. Otherwise the product is formed in
//! 128 bits so no input can overflow it; results past `u64::MAX` clamp.
//!
//! Naming follows `<from>_to_<to>_<rounding><width>`:
//! * `ceil`: "wait at least this long", never expires early.
//! * `floor`: "how much has fully elapsed", never over-reports.
//! * `near`: round half up.
//!
//! `32` variants truncate the result to `u32`.

use super::config::ClockConfig;

pub const MSEC_PER_SEC: u32 = 1_000;
pub const USEC_PER_SEC: u32 = 1_000_000;
pub const NSEC_PER_SEC: u32 = 1_000_000_000;

/// Rounding direction of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Floor,
    Ceil,
    Nearest,
}

/// Convert `t` units of `from_hz` into units of `to_hz`.
///
/// `exact_ratios` permits the single multiply/divide shortcut; it must be
/// false when either rate was measured at runtime and might not divide as
/// configured.
pub fn convert(t: u64, from_hz: u32, to_hz: u32, exact_ratios: bool, rounding: Rounding) -> u64 {
    if from_hz == to_hz {
        return t;
    }

    let mul_ratio = exact_ratios && to_hz > from_hz && to_hz % from_hz == 0;
    let div_ratio = exact_ratios && from_hz > to_hz && from_hz % to_hz == 0;

    if mul_ratio {
        let ratio = to_hz / from_hz;
        return match u32::try_from(t) {
            Ok(t32) => u64::from(t32) * u64::from(ratio),
            Err(_) => t.saturating_mul(u64::from(ratio)),
        };
    }

    let divisor = if div_ratio { from_hz / to_hz } else { from_hz };
    let offset = match rounding {
        Rounding::Floor => 0,
        Rounding::Ceil => divisor - 1,
        Rounding::Nearest => divisor / 2,
    };

    if div_ratio {
        let ratio = from_hz / to_hz;
        if let Some(t32) = u32::try_from(t).ok().and_then(|t| t.checked_add(offset)) {
            return u64::from(t32 / ratio);
        }
        let wide = (u128::from(t) + u128::from(offset)) / u128::from(ratio);
        return u64::try_from(wide).unwrap_or(u64::MAX);
    }

    let wide = (u128::from(t) * u128::from(to_hz) + u128::from(offset)) / u128::from(from_hz);
    u64::try_from(wide).unwrap_or(u64::MAX)
}

impl ClockConfig {
    fn from_ticks(&self, t: u64, to_hz: u32, rounding: Rounding) -> u64 {
        convert(t, self.ticks_per_sec, to_hz, true, rounding)
    }

    fn to_ticks(&self, t: u64, from_hz: u32, rounding: Rounding) -> u64 {
        convert(t, from_hz, self.ticks_per_sec, true, rounding)
    }

    fn cycles(&self, t: u64, from_hz: u32, to_hz: u32, rounding: Rounding) -> u64 {
        convert(t, from_hz, to_hz, !self.runtime_frequency, rounding)
    }

    // -- milliseconds -> ticks ---------------------------------------------

    pub fn ms_to_ticks_floor64(&self, ms: u64) -> u64 {
        self.to_ticks(ms, MSEC_PER_SEC, Rounding::Floor)
    }

    pub fn ms_to_ticks_floor32(&self, ms: u64) -> u32 {
        self.ms_to_ticks_floor64(ms) as u32
    }

    pub fn ms_to_ticks_ceil64(&self, ms: u64) -> u64 {
        self.to_ticks(ms, MSEC_PER_SEC, Rounding::Ceil)
    }

    pub fn ms_to_ticks_ceil32(&self, ms: u64) -> u32 {
        self.ms_to_ticks_ceil64(ms) as u32
    }

    pub fn ms_to_ticks_near64(&self, ms: u64) -> u64 {
        self.to_ticks(ms, MSEC_PER_SEC, Rounding::Nearest)
    }

    // -- micro/nanoseconds -> ticks ----------------------------------------

    pub fn us_to_ticks_floor64(&self, us: u64) -> u64 {
        self.to_ticks(us, USEC_PER_SEC, Rounding::Floor)
    }

    pub fn us_to_ticks_ceil64(&self, us: u64) -> u64 {
        self.to_ticks(us, USEC_PER_SEC, Rounding::Ceil)
    }

    pub fn ns_to_ticks_floor64(&self, ns: u64) -> u64 {
        self.to_ticks(ns, NSEC_PER_SEC, Rounding::Floor)
    }

    pub fn ns_to_ticks_ceil64(&self, ns: u64) -> u64 {
        self.to_ticks(ns, NSEC_PER_SEC, Rounding::Ceil)
    }

    // -- ticks -> wall units -----------------------------------------------

    pub fn ticks_to_ms_floor64(&self, ticks: u64) -> u64 {
        self.from_ticks(ticks, MSEC_PER_SEC, Rounding::Floor)
    }

    pub fn ticks_to_ms_floor32(&self, ticks: u64) -> u32 {
        self.ticks_to_ms_floor64(ticks) as u32
    }

    pub fn ticks_to_ms_ceil64(&self, ticks: u64) -> u64 {
        self.from_ticks(ticks, MSEC_PER_SEC, Rounding::Ceil)
    }

    pub fn ticks_to_us_floor64(&self, ticks: u64) -> u64 {
        self.from_ticks(ticks, USEC_PER_SEC, Rounding::Floor)
    }

    pub fn ticks_to_ns_floor64(&self, ticks: u64) -> u64 {
        self.from_ticks(ticks, NSEC_PER_SEC, Rounding::Floor)
    }

    // -- hardware cycles ---------------------------------------------------

    pub fn cyc_to_ticks_floor64(&self, cyc: u64) -> u64 {
        self.cycles(cyc, self.hw_cycles_per_sec, self.ticks_per_sec, Rounding::Floor)
    }

    pub fn cyc_to_ticks_floor32(&self, cyc: u64) -> u32 {
        self.cyc_to_ticks_floor64(cyc) as u32
    }

    pub fn cyc_to_ticks_ceil64(&self, cyc: u64) -> u64 {
        self.cycles(cyc, self.hw_cycles_per_sec, self.ticks_per_sec, Rounding::Ceil)
    }

    pub fn ticks_to_cyc_floor64(&self, ticks: u64) -> u64 {
        self.cycles(ticks, self.ticks_per_sec, self.hw_cycles_per_sec, Rounding::Floor)
    }

    pub fn ticks_to_cyc_floor32(&self, ticks: u64) -> u32 {
        self.ticks_to_cyc_floor64(ticks) as u32
    }

    pub fn cyc_to_ms_floor64(&self, cyc: u64) -> u64 {
        self.cycles(cyc, self.hw_cycles_per_sec, MSEC_PER_SEC, Rounding::Floor)
    }

    pub fn cyc_to_us_floor64(&self, cyc: u64) -> u64 {
        self.cycles(cyc, self.hw_cycles_per_sec, USEC_PER_SEC, Rounding::Floor)
    }

    pub fn cyc_to_ns_floor64(&self, cyc: u64) -> u64 {
        self.cycles(cyc, self.hw_cycles_per_sec, NSEC_PER_SEC, Rounding::Floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_rates_match() {
        assert_eq!(convert(12345, 1000, 1000, true, Rounding::Ceil), 12345);
    }

    #[test]
    fn test_out_of_range_results_clamp() {
        // Exact multiple: 1 kHz to 1 MHz.
        assert_eq!(convert(u64::MAX / 2, 1_000, 1_000_000, true, Rounding::Floor), u64::MAX);
        // Uneven ratio through the wide path.
        assert_eq!(convert(u64::MAX, 300, 32_768, true, Rounding::Ceil), u64::MAX);
        assert_eq!(convert(u64::MAX, 1_000, 1_000_000, false, Rounding::Floor), u64::MAX);
        // Still exact just below the limit.
        assert_eq!(convert(1 << 40, 1_000, 1_000_000, true, Rounding::Floor), 1_000 << 40);
    }

    #[test]
    fn test_even_ratio_floor_and_ceil() {
        // 100 Hz ticks: 10 ms per tick.
        let config = ClockConfig::new(1_000_000, 100);
        assert_eq!(config.ms_to_ticks_floor64(25), 2);
        assert_eq!(config.ms_to_ticks_ceil64(25), 3);
        assert_eq!(config.ms_to_ticks_ceil64(30), 3);
        assert_eq!(config.ms_to_ticks_near64(25), 3);
        assert_eq!(config.ms_to_ticks_near64(24), 2);
        assert_eq!(config.ticks_to_ms_floor64(7), 70);
    }

    #[test]
    fn test_uneven_ratio_avoids_drift() {
        // 32768 Hz counter, 100 Hz ticks: 327.68 cycles per tick.
        let config = ClockConfig::new(32_768, 100);
        assert_eq!(config.cyc_to_ticks_floor64(32_768), 100);
        assert_eq!(config.cyc_to_ticks_floor64(327), 0);
        assert_eq!(config.cyc_to_ticks_ceil64(327), 1);
        assert_eq!(config.cyc_to_ticks_floor64(32_768 * 3_600), 360_000);
        assert_eq!(config.ticks_to_cyc_floor64(100), 32_768);
    }

    #[test]
    fn test_ceil_never_undershoots_floor_never_overshoots() {
        let config = ClockConfig::new(32_768, 300);
        for ms in [0u64, 1, 3, 4, 999, 1_000, 65_535] {
            let ceil = config.ms_to_ticks_ceil64(ms);
            let floor = config.ms_to_ticks_floor64(ms);
            assert!(floor <= ceil);
            assert!(config.ticks_to_ms_floor64(floor) <= ms);
            assert!(ceil * 1_000 >= ms * 300);
        }
    }

    #[test]
    fn test_large_inputs_do_not_overflow() {
        let config = ClockConfig::new(1_000_000_007, 97);
        let ns = u64::MAX / 2;
        let expected = ((ns as u128) * 97 / 1_000_000_000) as u64;
        assert_eq!(config.ns_to_ticks_floor64(ns), expected);
    }

    #[test]
    fn test_runtime_frequency_takes_general_path() {
        let config = ClockConfig::new(0, 100).with_runtime_frequency(1_000_000);
        assert!(config.runtime_frequency);
        assert_eq!(config.cyc_to_ticks_floor64(25_000), 2);
        assert_eq!(config.cyc_to_ticks_ceil64(25_000), 3);
    }

    #[test]
    fn test_32bit_variants_truncate() {
        let config = ClockConfig::new(1_000_000, 1_000);
        assert_eq!(config.ticks_to_cyc_floor32(5_000_000), (5_000_000_000u64 as u32));
        assert_eq!(config.ms_to_ticks_ceil32(42), 42);
        assert_eq!(config.ticks_to_ms_floor32(42), 42);
        assert_eq!(config.cyc_to_ticks_floor32(3_999), 3);
    }

    #[test]
    fn test_sub_tick_units() {
        let config = ClockConfig::new(1_000_000, 1_000);
        assert_eq!(config.us_to_ticks_ceil64(1), 1);
        assert_eq!(config.us_to_ticks_floor64(1_999), 1);
        assert_eq!(config.ns_to_ticks_ceil64(1_000_001), 2);
        assert_eq!(config.ticks_to_us_floor64(3), 3_000);
        assert_eq!(config.ticks_to_ns_floor64(3), 3_000_000);
        assert_eq!(config.cyc_to_us_floor64(1_500), 1_500);
        assert_eq!(config.cyc_to_ns_floor64(3), 3_000);
        assert_eq!(config.cyc_to_ms_floor64(2_500), 2);
        assert_eq!(config.ticks_to_ms_ceil64(2), 2);
    }
}
