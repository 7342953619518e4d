//! Black-level offset calibration by per-channel bisection.

use scan_core::{CalibrationTargets, Result, SensorProfile};
use tracing::debug;

use super::{AnalogParams, CalibrationScanner, Outcome, ANALOG_CAPTURE_LINES};

/// Bisection state for one channel over inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bisection {
    low: i32,
    high: i32,
    /// Last value tried.
    pub current: u8,
    /// Window hit.
    pub done: bool,
}

impl Bisection {
    /// Search `[low, high]`.
    #[must_use]
    pub fn new(low: u8, high: u8) -> Self {
        let (low, high) = (i32::from(low.min(high)), i32::from(low.max(high)));
        Self {
            low,
            high,
            current: ((low + high) / 2) as u8,
            done: false,
        }
    }

    /// Whether the interval still holds candidates.
    #[must_use]
    pub fn open(&self) -> bool {
        !self.done && self.low <= self.high
    }

    /// Midpoint to try next.
    #[must_use]
    pub fn midpoint(&self) -> u8 {
        ((self.low + self.high) / 2).clamp(0, 255) as u8
    }

    /// Record the dark level measured at `tried`.
    ///
    /// `raises_black` tells which way the offset code moves the level.
    pub fn update(&mut self, tried: u8, level: f64, targets: &CalibrationTargets, raises_black: bool) {
        self.current = tried;
        if level >= f64::from(targets.dark_low) && level <= f64::from(targets.dark_high) {
            self.done = true;
            return;
        }
        let too_dark = level < f64::from(targets.dark_low);
        if too_dark == raises_black {
            self.low = i32::from(tried) + 1;
        } else {
            self.high = i32::from(tried) - 1;
        }
    }
}

/// Bisect all three offsets against `measure`, which returns the dark level
/// per channel for a set of offsets.
pub fn bisect_offsets<F>(targets: &CalibrationTargets, mut measure: F) -> Result<([u8; 3], Outcome)>
where
    F: FnMut([u8; 3]) -> Result<[f64; 3]>,
{
    let mut search = [Bisection::new(targets.offset_low, targets.offset_high); 3];
    let mut iterations = 0;
    while iterations < targets.offset_iterations && search.iter().any(Bisection::open) {
        iterations += 1;
        let tried = search.map(|b| if b.open() { b.midpoint() } else { b.current });
        let levels = measure(tried)?;
        debug!(iterations, ?tried, ?levels, "Offset capture");
        for (channel, b) in search.iter_mut().enumerate() {
            if b.open() {
                b.update(tried[channel], levels[channel], targets, targets.offset_raises_black);
            }
        }
    }
    let offsets = search.map(|b| b.current);
    let outcome = if search.iter().all(|b| b.done) {
        Outcome::Converged { iterations }
    } else {
        Outcome::CapReached { iterations }
    };
    Ok((offsets, outcome))
}

/// Find offsets that put the masked dark band inside `[dark_low, dark_high]`.
pub fn calibrate_offset(
    scanner: &mut dyn CalibrationScanner,
    params: &mut AnalogParams,
    sensor: &SensorProfile,
    targets: &CalibrationTargets,
) -> Result<Outcome> {
    let start = sensor.dark_margin_start as usize;
    let band = start..start + sensor.dark_margin_width as usize;
    let base = *params;
    let (offsets, outcome) = bisect_offsets(targets, |offsets| {
        let trial = AnalogParams { offset: offsets, ..base };
        let capture = scanner.capture(&trial, false, ANALOG_CAPTURE_LINES, 8)?;
        Ok(capture.band_means(band.clone()))
    })?;
    params.offset = offsets;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::tests::{small_sensor, LinearScanner};
    use proptest::prelude::*;

    fn linear(slope: f64, intercept: f64) -> impl FnMut([u8; 3]) -> Result<[f64; 3]> {
        move |o| Ok(o.map(|v| intercept + slope * f64::from(v)))
    }

    #[test]
    fn test_first_midpoint_can_converge() {
        let targets = CalibrationTargets::default();
        let (offsets, outcome) = bisect_offsets(&targets, linear(0.1, 0.0)).unwrap();
        assert_eq!(offsets, [127; 3]);
        assert_eq!(outcome, Outcome::Converged { iterations: 1 });
    }

    #[test]
    fn test_inverted_response() {
        let targets = CalibrationTargets {
            offset_raises_black: false,
            ..CalibrationTargets::default()
        };
        let (offsets, outcome) = bisect_offsets(&targets, linear(-0.5, 130.0)).unwrap();
        assert!(outcome.converged());
        for o in offsets {
            let level = 130.0 - 0.5 * f64::from(o);
            assert!((5.0..=15.0).contains(&level), "offset {o} gives {level}");
        }
    }

    #[test]
    fn test_unreachable_window_keeps_last_midpoint() {
        let targets = CalibrationTargets::default();
        let (offsets, outcome) = bisect_offsets(&targets, linear(0.0, 40.0)).unwrap();
        assert!(!outcome.converged());
        // always too bright, so the search runs down to the low bound
        assert_eq!(offsets, [0; 3]);
    }

    #[test]
    fn test_calibrate_offset_uses_dark_band() {
        let sensor = small_sensor();
        let targets = CalibrationTargets::default();
        let mut scanner = LinearScanner::new(sensor.clone(), true);
        let mut params = AnalogParams::from_sensor(&sensor);
        let outcome = calibrate_offset(&mut scanner, &mut params, &sensor, &targets).unwrap();
        assert!(outcome.converged());
        for o in params.offset {
            assert!((50..=150).contains(&o));
        }
    }

    proptest! {
        #[test]
        fn prop_bisection_converges_within_cap(
            slope in 0.05f64..4.0,
            zero in 0u8..=255,
            raises in any::<bool>(),
        ) {
            // a monotone response that crosses the window middle at `zero`
            let sign = if raises { 1.0 } else { -1.0 };
            let targets = CalibrationTargets {
                offset_raises_black: raises,
                ..CalibrationTargets::default()
            };
            let measure = |o: [u8; 3]| -> Result<[f64; 3]> {
                Ok(o.map(|v| 10.0 + sign * slope * (f64::from(v) - f64::from(zero))))
            };
            let (offsets, outcome) = bisect_offsets(&targets, measure).unwrap();
            prop_assert!(outcome.converged());
            if let Outcome::Converged { iterations } = outcome {
                prop_assert!(iterations <= targets.offset_iterations);
            }
            for o in offsets {
                let level = 10.0 + sign * slope * (f64::from(o) - f64::from(zero));
                prop_assert!((5.0..=15.0).contains(&level));
            }
        }
    }
}
