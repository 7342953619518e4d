//! Lamp warm-up.
//!
//! A cold lamp brightens for a while after it is switched on. The same
//! stationary line is captured over and over until two consecutive captures
//! agree and the lamp is bright enough.

use std::thread;
use std::time::Duration;

use scan_core::{CalibrationTargets, Result, SensorProfile};
use tracing::{debug, instrument};

use super::{active_band, AnalogParams, CalibrationScanner, Outcome, ANALOG_CAPTURE_LINES};

/// Whether a lamp reading `current` after `previous` counts as warm.
#[must_use]
pub fn is_warm(previous: f64, current: f64, targets: &CalibrationTargets) -> bool {
    (current - previous).abs() < f64::from(targets.warmup_delta)
        && current > f64::from(targets.warmup_min_level)
}

fn white_level(
    scanner: &mut dyn CalibrationScanner,
    params: &AnalogParams,
    sensor: &SensorProfile,
) -> Result<f64> {
    let capture = scanner.capture(params, true, ANALOG_CAPTURE_LINES, 8)?;
    let means = capture.band_means(active_band(sensor));
    Ok(means.iter().sum::<f64>() / 3.0)
}

/// Capture with the lamp on until its output settles.
///
/// Returns `None` when warm-up is disabled. `interval` is slept between
/// captures.
#[instrument(skip_all, fields(cap = targets.warmup_iterations))]
pub fn warm_up_lamp(
    scanner: &mut dyn CalibrationScanner,
    params: &AnalogParams,
    sensor: &SensorProfile,
    targets: &CalibrationTargets,
    interval: Duration,
) -> Result<Option<Outcome>> {
    if targets.warmup_iterations == 0 {
        return Ok(None);
    }
    let mut previous = white_level(scanner, params, sensor)?;
    let mut iterations = 1;
    while iterations < targets.warmup_iterations {
        if !interval.is_zero() {
            thread::sleep(interval);
        }
        let current = white_level(scanner, params, sensor)?;
        iterations += 1;
        debug!(iterations, previous, current, "Warm-up capture");
        if is_warm(previous, current, targets) {
            return Ok(Some(Outcome::Converged { iterations }));
        }
        previous = current;
    }
    Ok(Some(Outcome::CapReached { iterations }))
}
