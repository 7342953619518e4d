//! Calibration engine.
//!
//! The lamp is warmed up first, then four procedures run in order: exposure,
//! offset, gain, shading. Each one captures a few stationary lines through a
//! [`CalibrationScanner`], measures them, and adjusts the analog front end
//! until its window is hit or the profile's iteration cap runs out. Hitting a
//! cap is accepted and logged, never an error. Transport errors abort the
//! whole run.

pub mod exposure;
pub mod gain;
pub mod offset;
pub mod shading;
pub mod warmup;

use std::ops::Range;
use std::time::{Duration, Instant};

use scan_core::{CalibrationTargets, Result, ScanError, SensorProfile};
use tracing::{info, instrument, warn};

use crate::register_set::RegisterSet;

pub use shading::ShadingTable;

/// Lines captured by the analog procedures.
pub const ANALOG_CAPTURE_LINES: u32 = 4;

/// Per-channel analog front-end settings, R, G, B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogParams {
    /// Exposure time.
    pub exposure: [u16; 3],
    /// Gain code.
    pub gain: [u8; 3],
    /// Offset code.
    pub offset: [u8; 3],
}

impl AnalogParams {
    /// Profile defaults.
    #[must_use]
    pub fn from_sensor(sensor: &SensorProfile) -> Self {
        Self {
            exposure: sensor.default_exposure,
            gain: sensor.default_gain,
            offset: sensor.default_offset,
        }
    }

    /// Stage exposure, gain and offset registers.
    pub fn stage(&self, regs: &mut RegisterSet) -> Result<()> {
        let map = regs.map().clone();
        for channel in 0..3 {
            regs.set_field(map.exposure[channel], u32::from(self.exposure[channel]))?;
            regs.set_field(map.gain[channel], u32::from(self.gain[channel]))?;
            regs.set_field(map.offset[channel], u32::from(self.offset[channel]))?;
        }
        Ok(())
    }

    /// Longest channel exposure, which paces the motor.
    #[must_use]
    pub fn max_exposure(&self) -> u16 {
        self.exposure.iter().copied().max().unwrap_or(0)
    }
}

/// How a procedure ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every channel landed in its window.
    Converged {
        /// Captures taken.
        iterations: u32,
    },
    /// The cap ran out; the last values were kept.
    CapReached {
        /// Captures taken.
        iterations: u32,
    },
}

impl Outcome {
    /// True when every channel converged.
    #[must_use]
    pub fn converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub(crate) fn log(self, procedure: &'static str) -> Self {
        match self {
            Self::Converged { iterations } => {
                info!(procedure, iterations, "Calibration step converged");
            }
            Self::CapReached { iterations } => {
                warn!(procedure, iterations, "Calibration cap reached, keeping best effort");
            }
        }
        self
    }
}

/// Stationary capture decoded to samples, channels interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    /// Pixels per line.
    pub pixels: usize,
    /// Channels per pixel.
    pub channels: usize,
    /// Bits per sample: 8 or 16.
    pub depth: u8,
    /// One sample vector per line.
    pub lines: Vec<Vec<u16>>,
}

impl RawCapture {
    /// Decode raw device lines.
    pub fn from_raw(raw: &[Vec<u8>], pixels: usize, channels: usize, depth: u8) -> Result<Self> {
        let sample_bytes = usize::from(depth / 8).max(1);
        let expected = pixels * channels * sample_bytes;
        let mut lines = Vec::with_capacity(raw.len());
        for line in raw {
            if line.len() != expected {
                return Err(ScanError::invalid(
                    "calibration_line",
                    format!("{} bytes, expected {expected}", line.len()),
                ));
            }
            let samples = if sample_bytes == 2 {
                line.chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect()
            } else {
                line.iter().map(|&b| u16::from(b)).collect()
            };
            lines.push(samples);
        }
        if lines.is_empty() {
            return Err(ScanError::invalid("calibration_capture", "no lines captured"));
        }
        Ok(Self {
            pixels,
            channels,
            depth,
            lines,
        })
    }

    /// Sample of `pixel`/`channel` on every line.
    pub fn column(&self, pixel: usize, channel: usize) -> impl Iterator<Item = u16> + '_ {
        let at = pixel * self.channels + channel;
        self.lines.iter().map(move |l| l[at])
    }

    /// Mean of `channel` over `pixels` and all lines, scaled to 8 bits.
    #[must_use]
    pub fn band_mean(&self, channel: usize, pixels: Range<usize>) -> f64 {
        let pixels = pixels.start.min(self.pixels)..pixels.end.min(self.pixels);
        let count = pixels.len() * self.lines.len();
        if count == 0 {
            return 0.0;
        }
        let sum: u64 = pixels
            .flat_map(|p| self.column(p, channel))
            .map(u64::from)
            .sum();
        let mean = sum as f64 / count as f64;
        if self.depth == 16 {
            mean / 257.0
        } else {
            mean
        }
    }

    /// [`band_mean`](Self::band_mean) for every channel.
    #[must_use]
    pub fn band_means(&self, pixels: Range<usize>) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (channel, slot) in out.iter_mut().enumerate().take(self.channels) {
            *slot = self.band_mean(channel, pixels.clone());
        }
        out
    }
}

/// Source of stationary calibration captures.
pub trait CalibrationScanner {
    /// Capture `lines` full-sensor lines with `params` applied.
    fn capture(
        &mut self,
        params: &AnalogParams,
        lamp: bool,
        lines: u32,
        depth: u8,
    ) -> Result<RawCapture>;
}

/// Outcomes of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationReport {
    /// Lamp warm-up; `None` when disabled.
    pub warmup: Option<Outcome>,
    /// Exposure procedure.
    pub exposure: Outcome,
    /// Offset procedure.
    pub offset: Outcome,
    /// Gain procedure.
    pub gain: Outcome,
}

/// Cached result of a calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationState {
    /// Calibrated analog settings.
    pub analog: AnalogParams,
    /// Shading table at optical resolution.
    pub shading: ShadingTable,
    /// Per-procedure outcomes.
    pub report: CalibrationReport,
    /// When the run finished.
    pub created_at: Instant,
}

impl CalibrationState {
    /// Whether the state may still be reused. Zero minutes never expires.
    #[must_use]
    pub fn is_fresh(&self, expiry_minutes: u64) -> bool {
        expiry_minutes == 0
            || self.created_at.elapsed() < Duration::from_secs(expiry_minutes * 60)
    }
}

/// Active sensor columns, in capture coordinates.
pub(crate) fn active_band(sensor: &SensorProfile) -> Range<usize> {
    let start = sensor.first_active_pixel as usize;
    start..start + sensor.pixels as usize
}

/// Runs the procedures against one sensor.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationEngine<'a> {
    sensor: &'a SensorProfile,
    targets: &'a CalibrationTargets,
    warmup_interval: Duration,
}

impl<'a> CalibrationEngine<'a> {
    /// Engine for `sensor` with `targets`, no pause between warm-up captures.
    #[must_use]
    pub fn new(sensor: &'a SensorProfile, targets: &'a CalibrationTargets) -> Self {
        Self {
            sensor,
            targets,
            warmup_interval: Duration::ZERO,
        }
    }

    /// Pause between lamp warm-up captures.
    #[must_use]
    pub fn warmup_interval(mut self, interval: Duration) -> Self {
        self.warmup_interval = interval;
        self
    }

    /// Lamp warm-up, exposure, offset, gain, then shading.
    #[instrument(skip_all)]
    pub fn run(&self, scanner: &mut dyn CalibrationScanner) -> Result<CalibrationState> {
        let mut params = AnalogParams::from_sensor(self.sensor);
        let warmup = warmup::warm_up_lamp(
            scanner,
            &params,
            self.sensor,
            self.targets,
            self.warmup_interval,
        )?
        .map(|outcome| outcome.log("warmup"));
        let exposure = exposure::calibrate_exposure(scanner, &mut params, self.sensor, self.targets)?
            .log("exposure");
        let offset = offset::calibrate_offset(scanner, &mut params, self.sensor, self.targets)?
            .log("offset");
        let gain =
            gain::calibrate_gain(scanner, &mut params, self.sensor, self.targets)?.log("gain");
        let shading = shading::calibrate_shading(scanner, &params, self.sensor, self.targets)?;
        info!(
            exposure = ?params.exposure,
            gain = ?params.gain,
            offset = ?params.offset,
            "Calibration complete"
        );
        Ok(CalibrationState {
            analog: params,
            shading,
            report: CalibrationReport {
                warmup,
                exposure,
                offset,
                gain,
            },
            created_at: Instant::now(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use scan_core::ProfileRegistry;

    /// Linear front end: black level from the offset, white from exposure
    /// and gain, masked columns always black.
    pub(crate) struct LinearScanner {
        pub sensor: SensorProfile,
        pub raises_black: bool,
        pub captures: u32,
        pub fail_at: Option<u32>,
        /// Captures until the lamp is at full output; zero starts warm.
        pub warmup_captures: u32,
    }

    impl LinearScanner {
        pub(crate) fn new(sensor: SensorProfile, raises_black: bool) -> Self {
            Self {
                sensor,
                raises_black,
                captures: 0,
                fail_at: None,
                warmup_captures: 0,
            }
        }

        fn level(&self, params: &AnalogParams, lamp: bool, pixel: usize, channel: usize) -> f64 {
            let offset = f64::from(params.offset[channel]);
            let black = if self.raises_black {
                offset * 0.1
            } else {
                (255.0 - offset) * 0.1
            };
            let active = active_band(&self.sensor);
            if !lamp || !active.contains(&pixel) {
                return black;
            }
            let gain = 76.0 / (76.0 - f64::from(params.gain[channel]));
            // slight column ripple for the shading table
            let ripple = 1.0 + 0.02 * ((pixel % 7) as f64 - 3.0) / 3.0;
            let lamp_output = match self.warmup_captures {
                0 => 1.0,
                n => (f64::from(self.captures) / f64::from(n)).min(1.0),
            };
            f64::from(params.exposure[channel]) / 60.0 * gain * ripple * lamp_output + black
        }
    }

    impl CalibrationScanner for LinearScanner {
        fn capture(
            &mut self,
            params: &AnalogParams,
            lamp: bool,
            lines: u32,
            depth: u8,
        ) -> Result<RawCapture> {
            self.captures += 1;
            if self.fail_at == Some(self.captures) {
                return Err(ScanError::transport("bulk_read", "injected"));
            }
            let pixels = (self.sensor.first_active_pixel + self.sensor.pixels) as usize;
            let mut line = Vec::with_capacity(pixels * 3);
            for pixel in 0..pixels {
                for channel in 0..3 {
                    let v = self.level(params, lamp, pixel, channel).clamp(0.0, 255.0);
                    line.push(if depth == 16 {
                        (v * 257.0).round() as u16
                    } else {
                        v.round() as u16
                    });
                }
            }
            Ok(RawCapture {
                pixels,
                channels: 3,
                depth,
                lines: vec![line; lines as usize],
            })
        }
    }

    pub(crate) fn small_sensor() -> SensorProfile {
        let mut sensor = ProfileRegistry::builtin()
            .unwrap()
            .get("bh1200")
            .unwrap()
            .sensor
            .clone();
        sensor.pixels = 400;
        sensor
    }

    // =========================================================================
    // Capture decoding
    // =========================================================================

    #[test]
    fn test_raw_capture_decodes_sixteen_bit() {
        let raw = vec![vec![0x00, 0x01, 0xff, 0xff, 0x10, 0x00]];
        let cap = RawCapture::from_raw(&raw, 1, 3, 16).unwrap();
        assert_eq!(cap.lines[0], vec![256, 65535, 16]);
        assert!((cap.band_mean(1, 0..1) - 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_capture_rejects_bad_lengths() {
        assert!(RawCapture::from_raw(&[vec![0; 5]], 2, 3, 8).is_err());
        assert!(RawCapture::from_raw(&[], 2, 3, 8).is_err());
    }

    #[test]
    fn test_band_mean_clamps_range() {
        let cap = RawCapture::from_raw(&[vec![10, 20, 30, 30, 40, 50]], 2, 3, 8).unwrap();
        assert_eq!(cap.band_means(0..10), [20.0, 30.0, 40.0]);
    }

    // =========================================================================
    // Full run
    // =========================================================================

    #[test]
    fn test_full_run_converges() {
        let sensor = small_sensor();
        let targets = CalibrationTargets::default();
        let mut scanner = LinearScanner::new(sensor.clone(), true);
        let state = CalibrationEngine::new(&sensor, &targets)
            .run(&mut scanner)
            .unwrap();
        assert!(state.report.exposure.converged(), "{:?}", state.report);
        assert!(state.report.offset.converged(), "{:?}", state.report);
        assert!(state.report.gain.converged(), "{:?}", state.report);
        assert_eq!(state.report.warmup, Some(Outcome::Converged { iterations: 2 }));
        assert_eq!(
            state.shading.pixels(),
            (sensor.first_active_pixel + sensor.pixels) as usize
        );
        assert!(state.is_fresh(60));
        assert!(state.is_fresh(0));
    }

    #[test]
    fn test_run_warms_lamp_before_exposure() {
        let sensor = small_sensor();
        let targets = CalibrationTargets::default();
        let mut scanner = LinearScanner::new(sensor.clone(), true);
        scanner.warmup_captures = 3;
        let state = CalibrationEngine::new(&sensor, &targets)
            .run(&mut scanner)
            .unwrap();
        assert_eq!(state.report.warmup, Some(Outcome::Converged { iterations: 4 }));
        assert!(state.report.exposure.converged(), "{:?}", state.report);

        let skipped = CalibrationTargets {
            warmup_iterations: 0,
            ..CalibrationTargets::default()
        };
        let state = CalibrationEngine::new(&sensor, &skipped)
            .run(&mut LinearScanner::new(sensor.clone(), true))
            .unwrap();
        assert_eq!(state.report.warmup, None);
    }

    #[test]
    fn test_transport_error_aborts_run() {
        let sensor = small_sensor();
        let targets = CalibrationTargets::default();
        let mut scanner = LinearScanner::new(sensor.clone(), true);
        scanner.fail_at = Some(3);
        let err = CalibrationEngine::new(&sensor, &targets)
            .run(&mut scanner)
            .unwrap_err();
        assert!(matches!(err, ScanError::Transport { .. }));
        assert_eq!(scanner.captures, 3);
    }
}
