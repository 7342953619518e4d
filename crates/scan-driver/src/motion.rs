//! Stepper motion profiles.
//!
//! A [`SlopeTable`] holds per-step periods: larger values mean slower steps.
//! The acceleration segment is non-increasing and the deceleration segment
//! non-decreasing. Each scan gets two tables, one at scan speed and one for
//! fast relocation at the lowest supported resolution, plus the z-mode
//! phase values the ASIC needs for its own ramp logic.

use std::f64::consts::FRAC_PI_2;

use scan_core::{
    AddressWindow, MotorProfile, RamTarget, Result, ScanSetup, SensorProfile, SlopeCurve,
    StepMode,
};
use tracing::debug;

use crate::channel::CommandChannel;
use crate::register_set::RegisterSet;

/// Longest acceleration segment.
pub const MAX_ACCEL_STEPS: usize = 511;
/// Longest deceleration segment.
pub const MAX_DECEL_STEPS: usize = 255;

/// Word offset of the scan table in slope RAM.
const SCAN_TABLE_WORDS: u32 = 0;
/// Word offset of the fast table in slope RAM.
const FAST_TABLE_WORDS: u32 = 1024;
/// Words reserved for an acceleration segment.
const ACCEL_SLOT_WORDS: u32 = 512;

/// Acceleration, cruise and deceleration periods for one motion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlopeTable {
    /// Periods from start speed down to cruise, non-increasing.
    pub accel: Vec<u16>,
    /// Cruise period.
    pub cruise: u16,
    /// Periods from cruise back up to stop, non-decreasing.
    pub decel: Vec<u16>,
}

impl SlopeTable {
    /// The 2-entry table used when there is nothing to travel.
    #[must_use]
    pub fn minimal(period: u16) -> Self {
        Self {
            accel: vec![period, period],
            cruise: period,
            decel: Vec::new(),
        }
    }

    /// Entries in both ramps.
    #[must_use]
    pub fn ramp_len(&self) -> usize {
        self.accel.len() + self.decel.len()
    }

    /// Sum of acceleration periods.
    #[must_use]
    pub fn accel_time(&self) -> u64 {
        self.accel.iter().map(|&v| u64::from(v)).sum()
    }

    /// Whether the segment ordering holds.
    #[must_use]
    pub fn is_monotone(&self) -> bool {
        self.accel.windows(2).all(|w| w[0] >= w[1]) && self.decel.windows(2).all(|w| w[0] <= w[1])
    }

    /// Scale both ramps down so that they fit `travel` steps.
    fn fit(&mut self, travel: u32, multiplier: u8) {
        let per_entry = u64::from(multiplier.max(1));
        let needed = self.ramp_len() as u64 * per_entry;
        if needed <= u64::from(travel) {
            return;
        }
        if travel == 0 {
            let start = self.accel.first().copied().unwrap_or(self.cruise);
            *self = Self::minimal(start);
            return;
        }
        let budget = u64::from(travel) / per_entry;
        let total = self.ramp_len() as u64;
        let accel = ((self.accel.len() as u64 * budget) / total).max(1) as usize;
        let decel = ((self.decel.len() as u64 * budget) / total) as usize;
        self.accel.truncate(accel);
        let skip = self.decel.len() - decel.min(self.decel.len());
        self.decel.drain(..skip);
        self.cruise = self.accel.last().copied().unwrap_or(self.cruise);
    }

    fn words_le(periods: &[u16]) -> Vec<u8> {
        periods.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Power-law ramp from `vstart` towards `vend`, stopping at `vtarget`.
fn power_ramp(vstart: u16, vend: u16, g: f64, steps: usize, vtarget: u16) -> Vec<u16> {
    if vstart <= vtarget || steps < 2 {
        return vec![vtarget];
    }
    let mut table = Vec::with_capacity(steps);
    for i in 0..steps {
        let t = (i as f64 / (steps - 1) as f64).powf(g);
        let v = f64::from(vstart) * (1.0 - t) + t * f64::from(vend);
        if v <= f64::from(vtarget) {
            table.push(vtarget);
            break;
        }
        table.push(v as u16);
    }
    if table.last() != Some(&vtarget) {
        table.push(vtarget);
    }
    table
}

/// Exponential acceleration from `start` to `end` over `steps` entries.
fn exponential_accel(start: u16, end: u16, steps: usize) -> Vec<u16> {
    if start <= end || steps < 2 {
        return vec![end];
    }
    let n = steps as f64;
    let span = f64::from(start - end);
    let floor = 0.09f64.powf(FRAC_PI_2 * (n - 1.0) / n);
    (0..steps)
        .map(|i| {
            let v = span * (0.09f64.powf(FRAC_PI_2 * i as f64 / n) - floor) + f64::from(end);
            v.round() as u16
        })
        .collect()
}

/// Exponential deceleration from `end` back up towards `start`.
fn exponential_decel(start: u16, end: u16, steps: usize) -> Vec<u16> {
    if start <= end || steps == 0 {
        return Vec::new();
    }
    let n = steps as f64;
    let span = f64::from(start - end);
    (0..steps)
        .map(|i| {
            let v = f64::from(start) - span * 0.3f64.powf(FRAC_PI_2 * i as f64 / n);
            v.round() as u16
        })
        .collect()
}

fn shifted(period: u32, mode: StepMode) -> u16 {
    (period >> mode.shift()).clamp(1, u32::from(u16::MAX)) as u16
}

/// Build a slope table for one motion.
///
/// `travel` is the total distance in micro-steps; shorter travels scale the
/// ramps down uniformly and zero travel yields [`SlopeTable::minimal`].
#[must_use]
pub fn slope_table(
    motor: &MotorProfile,
    ydpi: u16,
    exposure: u16,
    mode: StepMode,
    travel: u32,
) -> SlopeTable {
    let vstart = shifted(u32::from(motor.start_speed), mode);
    let vend = shifted(u32::from(motor.max_speed), mode);
    let raw_target = (u64::from(exposure) * u64::from(ydpi) / u64::from(motor.base_ydpi.max(1)))
        .min(u64::from(u16::MAX)) as u32;
    let vtarget = shifted(raw_target, mode).max(vend);
    let steps = (usize::from(motor.min_steps) << mode.shift()).clamp(2, MAX_ACCEL_STEPS);

    let (mut accel, decel) = match motor.curve {
        SlopeCurve::Power => {
            let accel = power_ramp(vstart, vend, motor.slope_exponent, steps, vtarget);
            let mut decel: Vec<u16> = accel.iter().rev().copied().collect();
            decel.truncate(MAX_DECEL_STEPS);
            (accel, decel)
        }
        SlopeCurve::Exponential => {
            let accel = exponential_accel(vstart, vtarget, steps);
            let decel = exponential_decel(vstart, vtarget, steps.min(MAX_DECEL_STEPS));
            (accel, decel)
        }
    };
    accel.truncate(MAX_ACCEL_STEPS);

    let mut table = SlopeTable {
        cruise: accel.last().copied().unwrap_or(vtarget),
        accel,
        decel,
    };
    table.fit(travel, motor.multiplier);
    table
}

/// Back-home table built from the profile's home speeds.
#[must_use]
pub fn home_table(motor: &MotorProfile) -> SlopeTable {
    let steps = usize::from(motor.min_steps).clamp(2, MAX_ACCEL_STEPS);
    let accel = exponential_accel(motor.home_start_speed, motor.home_end_speed, steps);
    let decel = exponential_decel(
        motor.home_start_speed,
        motor.home_end_speed,
        steps.min(MAX_DECEL_STEPS),
    );
    SlopeTable {
        cruise: accel.last().copied().unwrap_or(motor.home_end_speed),
        accel,
        decel,
    }
}

/// Phase values for the ASIC's autonomous ramp logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZMode {
    /// Phase for buffer-full stop and resume.
    pub z1: u32,
    /// Phase for the acceleration before the scan.
    pub z2: u32,
}

/// Compute z-mode phases.
///
/// `feed` is the scan-speed distance before the first line; with a fast
/// table in use only the re-synchronization distance counts.
#[must_use]
pub fn z_mode(table: &SlopeTable, exposure: u16, fwd_step: u8, feed: u32, two_table: bool) -> ZMode {
    let exposure = u64::from(exposure.max(1));
    let sum = table.accel_time();
    let last = u64::from(table.cruise);
    let z1 = (sum + u64::from(fwd_step) * last) % exposure;
    let lead = if two_table { u64::from(fwd_step) } else { u64::from(feed) };
    let z2 = (sum + lead * last) % exposure;
    ZMode {
        z1: z1 as u32,
        z2: z2 as u32,
    }
}

/// Motor driver current for a cruise period.
#[must_use]
pub const fn motor_current(cruise: u16) -> u8 {
    match cruise {
        0..=1999 => 255,
        2000..=3499 => 200,
        3500..=4999 => 160,
        5000..=9999 => 70,
        10000..=16999 => 60,
        _ => 50,
    }
}

/// Micro-steps covering `lines` at `ydpi`.
#[must_use]
pub fn steps_for_lines(motor: &MotorProfile, ydpi: u16, lines: u32, mode: StepMode) -> u32 {
    let full = u64::from(lines) * u64::from(motor.base_ydpi) / u64::from(ydpi.max(1));
    (full << mode.shift()).min(u64::from(u32::MAX)) as u32
}

/// Everything the motor needs for one scan or move.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionPlan {
    /// Table used while capturing.
    pub scan: SlopeTable,
    /// Table used for relocation.
    pub fast: SlopeTable,
    /// Micro-stepping mode.
    pub step_mode: StepMode,
    /// Step multiplier.
    pub multiplier: u8,
    /// Fast-table distance before the first line.
    pub feed_steps: u32,
    /// Distance covered while capturing.
    pub scan_steps: u32,
    /// Ramp phases.
    pub z: ZMode,
    /// Driver current code.
    pub current: u8,
    /// Re-synchronization distance.
    pub fwd_step: u8,
}

impl MotionPlan {
    /// Plan the motion for `setup` at `exposure`.
    #[must_use]
    pub fn for_scan(
        motor: &MotorProfile,
        sensor: &SensorProfile,
        setup: &ScanSetup,
        exposure: u16,
    ) -> Self {
        let mode = motor.step_mode;
        let scan_steps = steps_for_lines(motor, setup.resolution, setup.raw_lines, mode);
        let feed_steps = steps_for_lines(motor, setup.resolution, setup.y_origin, mode);
        let scan = slope_table(motor, setup.resolution, exposure, mode, scan_steps);
        let fast = slope_table(
            motor,
            sensor.lowest_resolution(),
            motor.fast_exposure,
            mode,
            feed_steps,
        );
        let two_table = feed_steps > 0;
        let z = z_mode(&scan, exposure, motor.fwd_step, feed_steps, two_table);
        let plan = Self {
            current: motor_current(scan.cruise),
            scan,
            fast,
            step_mode: mode,
            multiplier: motor.multiplier,
            feed_steps,
            scan_steps,
            z,
            fwd_step: motor.fwd_step,
        };
        debug!(
            accel = plan.scan.accel.len(),
            decel = plan.scan.decel.len(),
            cruise = plan.scan.cruise,
            feed_steps,
            scan_steps,
            "Planned scan motion"
        );
        plan
    }

    /// Plan a non-imaging move of `steps` micro-steps.
    #[must_use]
    pub fn for_move(motor: &MotorProfile, sensor: &SensorProfile, steps: u32) -> Self {
        let mode = motor.step_mode;
        let fast = slope_table(
            motor,
            sensor.lowest_resolution(),
            motor.fast_exposure,
            mode,
            steps,
        );
        Self {
            current: motor_current(fast.cruise),
            scan: fast.clone(),
            z: z_mode(&fast, motor.fast_exposure, motor.fwd_step, steps, true),
            fast,
            step_mode: mode,
            multiplier: motor.multiplier,
            feed_steps: steps,
            scan_steps: 0,
            fwd_step: motor.fwd_step,
        }
    }

    /// Plan the slow return to the home sensor.
    #[must_use]
    pub fn for_home(motor: &MotorProfile) -> Self {
        let table = home_table(motor);
        Self {
            current: motor_current(table.cruise),
            z: ZMode::default(),
            scan: table.clone(),
            fast: table,
            step_mode: motor.step_mode,
            multiplier: motor.multiplier,
            feed_steps: motor.home_travel_steps,
            scan_steps: 0,
            fwd_step: motor.fwd_step,
        }
    }

    /// Stage motor registers.
    pub fn apply(&self, regs: &mut RegisterSet) -> Result<()> {
        let map = regs.map().clone();
        regs.set_field(
            map.step_mode,
            u32::from(self.step_mode.code() | (self.multiplier.min(15) << 4)),
        )?;
        regs.set_field(map.accel_steps, self.scan.accel.len() as u32)?;
        regs.set_field(map.decel_steps, self.scan.decel.len() as u32)?;
        regs.set_field(map.cruise_speed, u32::from(self.scan.cruise))?;
        regs.set_field(map.fast_steps, self.fast.accel.len() as u32)?;
        regs.set_field(map.feed_steps, self.feed_steps.min(map.feed_steps.max_value()))?;
        regs.set_field(map.fwd_step, u32::from(self.fwd_step))?;
        regs.set_field(map.z1, self.z.z1)?;
        regs.set_field(map.z2, self.z.z2)?;
        regs.set_field(map.motor_current, u32::from(self.current))?;
        Ok(())
    }

    /// Write both tables to slope RAM.
    pub fn upload(&self, channel: &dyn CommandChannel) -> Result<()> {
        let slots = [
            (SCAN_TABLE_WORDS, &self.scan.accel),
            (SCAN_TABLE_WORDS + ACCEL_SLOT_WORDS, &self.scan.decel),
            (FAST_TABLE_WORDS, &self.fast.accel),
            (FAST_TABLE_WORDS + ACCEL_SLOT_WORDS, &self.fast.decel),
        ];
        for (start, periods) in slots {
            if periods.is_empty() {
                continue;
            }
            let window = AddressWindow::Ram {
                target: RamTarget::Slope,
                start,
            };
            channel.bulk_write(window, &SlopeTable::words_le(periods))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;
    use proptest::prelude::*;
    use scan_core::{AsicFamily, ProfileRegistry, RegisterMap, ScanRequest};

    fn motor(model: &str) -> MotorProfile {
        ProfileRegistry::builtin().unwrap().get(model).unwrap().motor.clone()
    }

    // =========================================================================
    // Curves
    // =========================================================================

    #[test]
    fn test_power_ramp_stops_at_target() {
        let table = power_ramp(8000, 1500, 0.8, 200, 3000);
        assert_eq!(table.first(), Some(&8000));
        assert_eq!(table.last(), Some(&3000));
        assert!(table.windows(2).all(|w| w[0] >= w[1]));
        assert!(table.len() < 200);
    }

    #[test]
    fn test_power_ramp_target_slower_than_start() {
        assert_eq!(power_ramp(2000, 1500, 0.8, 100, 2500), vec![2500]);
    }

    #[test]
    fn test_exponential_curves() {
        let accel = exponential_accel(5000, 1200, 100);
        assert_eq!(accel.last(), Some(&1200));
        assert!(accel.windows(2).all(|w| w[0] >= w[1]));
        let decel = exponential_decel(5000, 1200, 100);
        assert_eq!(decel.first(), Some(&1200));
        assert!(decel.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_step_mode_shifts_speeds() {
        let m = motor("bh1200");
        let full = slope_table(&m, 300, 7000, StepMode::Full, 100_000);
        let quarter = slope_table(&m, 300, 7000, StepMode::Quarter, 100_000);
        assert_eq!(quarter.accel[0], full.accel[0] >> 2);
    }

    #[test]
    fn test_zero_travel_minimal_table() {
        let table = slope_table(&motor("bh1200"), 300, 7000, StepMode::Full, 0);
        assert_eq!(table.accel.len(), 2);
        assert!(table.decel.is_empty());
    }

    #[test]
    fn test_short_travel_scales_down() {
        let m = motor("bh1200");
        let long = slope_table(&m, 75, 7000, StepMode::Full, 1_000_000);
        let short = slope_table(&m, 75, 7000, StepMode::Full, 40);
        assert!(short.ramp_len() < long.ramp_len());
        assert!(short.ramp_len() as u32 * u32::from(m.multiplier) <= 40 + u32::from(m.multiplier));
        assert!(short.is_monotone());
    }

    // =========================================================================
    // Derived values
    // =========================================================================

    #[test]
    fn test_motor_current_thresholds() {
        assert_eq!(motor_current(1999), 255);
        assert_eq!(motor_current(2000), 200);
        assert_eq!(motor_current(4999), 160);
        assert_eq!(motor_current(9999), 70);
        assert_eq!(motor_current(16999), 60);
        assert_eq!(motor_current(17000), 50);
    }

    #[test]
    fn test_z_mode() {
        let table = SlopeTable {
            accel: vec![100, 80, 60],
            cruise: 60,
            decel: vec![60, 80],
        };
        let z = z_mode(&table, 500, 2, 10, false);
        assert_eq!(z.z1, (240 + 2 * 60) % 500);
        assert_eq!(z.z2, (240 + 10 * 60) % 500);
        let z = z_mode(&table, 500, 2, 10, true);
        assert_eq!(z.z2, z.z1);
    }

    #[test]
    fn test_home_table_uses_home_speeds() {
        let table = home_table(&motor("cp1200"));
        assert_eq!(table.cruise, 1200);
        assert!(table.accel[0] <= 5000);
        assert!(table.is_monotone());
    }

    #[test]
    fn test_plan_apply_and_upload() {
        let profile = ProfileRegistry::builtin().unwrap().get("bh1200").unwrap();
        let req = ScanRequest::builder().resolution(300).origin(0, 30).area(100, 100).build();
        let setup = ScanSetup::resolve(&req, &profile).unwrap();
        let plan = MotionPlan::for_scan(&profile.motor, &profile.sensor, &setup, 7000);
        assert!(plan.feed_steps > 0);

        let mut regs = RegisterSet::new(RegisterMap::for_family(AsicFamily::BulkHeader));
        plan.apply(&mut regs).unwrap();
        assert_eq!(regs.field(regs.map().accel_steps), plan.scan.accel.len() as u32);
        assert_eq!(regs.field(regs.map().motor_current), u32::from(plan.current));

        let channel = MemoryChannel::new(64);
        plan.upload(&channel).unwrap();
        let ram = channel.ram.lock();
        assert!(!ram.is_empty());
        assert_eq!(ram[0].1.len(), plan.scan.accel.len() * 2);
    }

    proptest! {
        #[test]
        fn prop_slope_bounds_and_monotone(
            ydpi in prop::sample::select(vec![75u16, 150, 300, 600, 1200]),
            exposure in 500u16..30000,
            travel in 0u32..200_000,
            mode in prop::sample::select(vec![StepMode::Full, StepMode::Half, StepMode::Quarter, StepMode::Eighth]),
            exponential in any::<bool>(),
        ) {
            let mut m = motor("bh1200");
            if exponential {
                m.curve = SlopeCurve::Exponential;
            }
            let table = slope_table(&m, ydpi, exposure, mode, travel);
            prop_assert!(table.accel.len() <= MAX_ACCEL_STEPS);
            prop_assert!(table.decel.len() <= MAX_DECEL_STEPS);
            prop_assert!(!table.accel.is_empty());
            prop_assert!(table.is_monotone());
        }
    }
}
