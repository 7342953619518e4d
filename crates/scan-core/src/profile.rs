//! Static per-model sensor and motor constants.
//!
//! Profiles are immutable configuration. They are deserialized from TOML
//! (see [`crate::config`]), validated once, and shared behind an `Arc` by
//! every session opened for that model.

use serde::{Deserialize, Serialize};

use crate::config::ConfigLoadError;
use crate::protocol::AsicFamily;

/// Stepper micro-stepping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// One step per phase.
    #[default]
    Full,
    /// Two micro-steps.
    Half,
    /// Four micro-steps.
    Quarter,
    /// Eight micro-steps.
    Eighth,
}

impl StepMode {
    /// Right shift applied to step periods in this mode.
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Full => 0,
            Self::Half => 1,
            Self::Quarter => 2,
            Self::Eighth => 3,
        }
    }

    /// Register encoding.
    #[must_use]
    pub const fn code(self) -> u8 {
        self.shift() as u8
    }
}

/// Shape of the acceleration ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlopeCurve {
    /// `v = vstart·(1−t) + vend·t` with `t = (i/(n−1))^g`.
    #[default]
    Power,
    /// Exponential approach towards the cruise period.
    Exponential,
}

/// Output channel ordering for color scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    /// Red, green, blue.
    #[default]
    Rgb,
    /// Blue, green, red.
    Bgr,
}

/// Which sensor row leads on dual-row sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DualRowPhase {
    /// Even columns come from the lagging row.
    #[default]
    EvenLags,
    /// Odd columns come from the lagging row.
    OddLags,
}

/// Optical sensor constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorProfile {
    /// Native horizontal resolution.
    pub optical_dpi: u16,
    /// Supported scan resolutions, ascending.
    pub resolutions: Vec<u16>,
    /// Active pixels at optical resolution.
    pub pixels: u32,
    /// First active pixel after the masked margin.
    pub first_active_pixel: u32,
    /// Start of the masked dark band, in optical pixels.
    pub dark_margin_start: u32,
    /// Width of the masked dark band.
    pub dark_margin_width: u32,
    /// Line offset between color channels at optical resolution.
    #[serde(default)]
    pub line_distance: u16,
    /// Line offset between the two rows of a dual-row sensor, applied only
    /// at optical resolution. Zero for single-row sensors.
    #[serde(default)]
    pub dual_row_distance: u16,
    /// Dual-row phase.
    #[serde(default)]
    pub dual_row_phase: DualRowPhase,
    /// Columns re-derived from the previous line on dual-row scans.
    #[serde(default = "default_edge_columns")]
    pub edge_columns: u16,
    /// Line period in pixel clocks.
    pub line_period: u16,
    /// Exposure used before calibration.
    pub default_exposure: [u16; 3],
    /// Gain used before calibration.
    pub default_gain: [u8; 3],
    /// Offset used before calibration.
    pub default_offset: [u8; 3],
    /// Output channel order.
    #[serde(default)]
    pub color_order: ColorOrder,
}

fn default_edge_columns() -> u16 {
    4
}

impl SensorProfile {
    /// Lowest supported resolution.
    #[must_use]
    pub fn lowest_resolution(&self) -> u16 {
        self.resolutions.iter().copied().min().unwrap_or(self.optical_dpi)
    }

    /// Whether `dpi` is supported.
    #[must_use]
    pub fn supports(&self, dpi: u16) -> bool {
        self.resolutions.contains(&dpi)
    }

    /// Active pixels at `dpi`.
    #[must_use]
    pub fn pixels_at(&self, dpi: u16) -> u32 {
        self.pixels * u32::from(dpi) / u32::from(self.optical_dpi)
    }
}

/// Stepper motor constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorProfile {
    /// Vertical resolution of one full step.
    pub base_ydpi: u16,
    /// Slowest period the motor can start at.
    pub start_speed: u16,
    /// Fastest period the motor can run at.
    pub max_speed: u16,
    /// Steps over which the full ramp is spread.
    pub min_steps: u16,
    /// Exponent of the power ramp.
    #[serde(default = "default_slope_exponent")]
    pub slope_exponent: f64,
    /// Ramp shape.
    #[serde(default)]
    pub curve: SlopeCurve,
    /// Micro-stepping mode for scan moves.
    #[serde(default)]
    pub step_mode: StepMode,
    /// Step multiplier written next to the step mode.
    #[serde(default = "default_multiplier")]
    pub multiplier: u8,
    /// Exposure used for fast relocation moves.
    pub fast_exposure: u16,
    /// Minimum re-synchronization step distance.
    #[serde(default = "default_fwd_step")]
    pub fwd_step: u8,
    /// Start period of the back-home ramp.
    #[serde(default = "default_home_start")]
    pub home_start_speed: u16,
    /// Cruise period of the back-home ramp.
    #[serde(default = "default_home_end")]
    pub home_end_speed: u16,
    /// Upper bound on a back-home move.
    #[serde(default = "default_home_travel")]
    pub home_travel_steps: u32,
}

fn default_slope_exponent() -> f64 {
    0.8
}
fn default_multiplier() -> u8 {
    4
}
fn default_fwd_step() -> u8 {
    20
}
fn default_home_start() -> u16 {
    5000
}
fn default_home_end() -> u16 {
    1200
}
fn default_home_travel() -> u32 {
    60000
}

/// Calibration windows, iteration caps and strip-search thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationTargets {
    /// Lower bound of the dark window.
    pub dark_low: u16,
    /// Upper bound of the dark window.
    pub dark_high: u16,
    /// Lower bound of the white window.
    pub white_low: u16,
    /// Upper bound of the white window.
    pub white_high: u16,
    /// Lower bound of the exposure window.
    pub led_low: u16,
    /// Upper bound of the exposure window.
    pub led_high: u16,
    /// Largest gain code.
    pub gain_max: u8,
    /// Offset search lower bound.
    pub offset_low: u8,
    /// Offset search upper bound.
    pub offset_high: u8,
    /// Offset raises the black level when true.
    pub offset_raises_black: bool,
    /// Offset iteration cap.
    pub offset_iterations: u32,
    /// Gain iteration cap.
    pub gain_iterations: u32,
    /// Exposure iteration cap.
    pub exposure_iterations: u32,
    /// Exposure floor.
    pub exposure_min: u16,
    /// Exposure ceiling.
    pub exposure_max: u16,
    /// Lines captured for shading.
    pub shading_lines: u32,
    /// First rank (descending) averaged by the shading filter.
    pub shading_filter_low: u32,
    /// One past the last rank averaged by the shading filter.
    pub shading_filter_high: u32,
    /// Coefficient meaning "unity gain".
    pub shading_unity: u16,
    /// Minutes a cached calibration stays valid; zero means forever.
    pub cache_expiry_minutes: u64,
    /// Lamp warm-up capture cap; zero skips warm-up.
    pub warmup_iterations: u32,
    /// Largest change of the white mean between two captures of a warm lamp.
    pub warmup_delta: u16,
    /// White mean a warm lamp must exceed.
    pub warmup_min_level: u16,
    /// Samples at or below this are black during strip search.
    pub strip_black_threshold: u8,
    /// Samples at or above this are white during strip search.
    pub strip_white_threshold: u8,
    /// Fraction of matching samples that makes a line a strip.
    pub strip_ratio: f64,
    /// Lines per strip-search pass.
    pub strip_lines: u32,
    /// Strip-search pass cap.
    pub strip_passes: u32,
}

impl Default for CalibrationTargets {
    fn default() -> Self {
        Self {
            dark_low: 5,
            dark_high: 15,
            white_low: 210,
            white_high: 220,
            led_low: 190,
            led_high: 210,
            gain_max: 63,
            offset_low: 0,
            offset_high: 255,
            offset_raises_black: true,
            offset_iterations: 10,
            gain_iterations: 10,
            exposure_iterations: 8,
            exposure_min: 500,
            exposure_max: 30000,
            shading_lines: 40,
            shading_filter_low: 20,
            shading_filter_high: 30,
            shading_unity: 0x2000,
            cache_expiry_minutes: 60,
            warmup_iterations: 60,
            warmup_delta: 15,
            warmup_min_level: 55,
            strip_black_threshold: 90,
            strip_white_threshold: 150,
            strip_ratio: 0.97,
            strip_lines: 10,
            strip_passes: 20,
        }
    }
}

/// Bus transfer limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferLimits {
    /// Largest bulk chunk.
    pub max_chunk: usize,
    /// Block size every non-final fragment must be a multiple of.
    pub block_size: usize,
    /// Transfer buffer size in bytes.
    pub buffer_bytes: usize,
    /// Largest register block written in one batch.
    pub register_block: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_chunk: 0xeff0,
            block_size: 512,
            buffer_bytes: 4 * 1024 * 1024,
            register_block: 32,
        }
    }
}

/// Bounded polling contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollTiming {
    /// Attempts waiting for the first image data.
    pub data_poll_attempts: u32,
    /// Interval between data polls.
    pub data_poll_interval_ms: u64,
    /// Attempts waiting for the stop action.
    pub stop_poll_attempts: u32,
    /// Interval between stop polls.
    pub stop_poll_interval_ms: u64,
    /// Attempts waiting for the home sensor.
    pub home_poll_attempts: u32,
    /// Interval between home polls.
    pub home_poll_interval_ms: u64,
    /// Attempts waiting for a feed to finish.
    pub feed_poll_attempts: u32,
    /// Interval between feed polls.
    pub feed_poll_interval_ms: u64,
    /// Consumer wait between ready-line checks.
    pub consumer_wait_us: u64,
    /// Pause between lamp warm-up captures.
    pub warmup_interval_ms: u64,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            data_poll_attempts: 500,
            data_poll_interval_ms: 10,
            stop_poll_attempts: 100,
            stop_poll_interval_ms: 10,
            home_poll_attempts: 300,
            home_poll_interval_ms: 100,
            feed_poll_attempts: 300,
            feed_poll_interval_ms: 100,
            consumer_wait_us: 200,
            warmup_interval_ms: 1000,
        }
    }
}

/// Register value written at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDefault {
    /// Address.
    pub addr: u16,
    /// Value.
    pub value: u8,
}

/// Everything the engine needs to know about one scanner model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Model identifier; filled from the table key when loaded from a file.
    #[serde(default)]
    pub model: String,
    /// Command framing family.
    pub family: AsicFamily,
    /// Sheet-fed devices skip the stop action.
    #[serde(default)]
    pub sheetfed: bool,
    /// Optical constants.
    pub sensor: SensorProfile,
    /// Motor constants.
    pub motor: MotorProfile,
    /// Calibration targets.
    #[serde(default)]
    pub calibration: CalibrationTargets,
    /// Transfer limits.
    #[serde(default)]
    pub transfer: TransferLimits,
    /// Polling contracts.
    #[serde(default)]
    pub timing: PollTiming,
    /// Registers written at init.
    #[serde(default)]
    pub register_defaults: Vec<RegisterDefault>,
}

impl ModelProfile {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let fail = |msg: String| Err(ConfigLoadError::ValidationError(format!("{}: {msg}", self.model)));

        let sensor = &self.sensor;
        if sensor.resolutions.is_empty() {
            return fail("sensor.resolutions is empty".into());
        }
        if let Some(bad) = sensor
            .resolutions
            .iter()
            .find(|&&r| r == 0 || r > sensor.optical_dpi)
        {
            return fail(format!(
                "resolution {bad} outside 1..={}",
                sensor.optical_dpi
            ));
        }
        if sensor.pixels == 0 || sensor.line_period == 0 {
            return fail("sensor.pixels and sensor.line_period must be non-zero".into());
        }
        if sensor.dark_margin_width == 0
            || sensor.dark_margin_start + sensor.dark_margin_width > sensor.first_active_pixel
        {
            return fail("dark margin must be a non-empty band before the first active pixel".into());
        }

        let motor = &self.motor;
        if motor.max_speed == 0 || motor.start_speed < motor.max_speed {
            return fail("motor.start_speed must be >= motor.max_speed > 0".into());
        }
        if motor.home_end_speed == 0 || motor.home_start_speed < motor.home_end_speed {
            return fail("motor home speeds must satisfy start >= end > 0".into());
        }
        if !(motor.slope_exponent > 0.0) || motor.base_ydpi == 0 || motor.min_steps == 0 {
            return fail("motor.slope_exponent, base_ydpi and min_steps must be positive".into());
        }
        if motor.multiplier == 0 || motor.multiplier > 15 {
            return fail(format!("motor.multiplier {} outside 1..=15", motor.multiplier));
        }

        let cal = &self.calibration;
        if !(cal.dark_low <= cal.dark_high
            && cal.dark_high < cal.white_low
            && cal.white_low <= cal.white_high
            && cal.led_low <= cal.led_high)
        {
            return fail("calibration windows must be ordered dark < white".into());
        }
        if cal.offset_low >= cal.offset_high {
            return fail("calibration.offset_low must be below offset_high".into());
        }
        if cal.offset_iterations == 0 || cal.gain_iterations == 0 || cal.exposure_iterations == 0 {
            return fail("calibration iteration caps must be positive".into());
        }
        if cal.exposure_min == 0 || cal.exposure_min > cal.exposure_max {
            return fail("calibration exposure bounds must satisfy 0 < min <= max".into());
        }
        if cal.shading_filter_low >= cal.shading_filter_high
            || cal.shading_filter_high > cal.shading_lines
        {
            return fail("shading filter band must lie inside shading_lines".into());
        }
        if !(0.0..=1.0).contains(&cal.strip_ratio) || cal.strip_passes == 0 || cal.strip_lines == 0 {
            return fail("strip search parameters out of range".into());
        }

        let transfer = &self.transfer;
        if !transfer.block_size.is_power_of_two() || transfer.max_chunk < transfer.block_size {
            return fail("transfer.block_size must be a power of two no larger than max_chunk".into());
        }
        if transfer.register_block == 0 || transfer.buffer_bytes == 0 {
            return fail("transfer.register_block and buffer_bytes must be positive".into());
        }
        Ok(())
    }
}
