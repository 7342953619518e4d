//! Analog gain calibration.

use scan_core::{CalibrationTargets, Result, SensorProfile};
use tracing::debug;

use super::{active_band, AnalogParams, CalibrationScanner, Outcome, ANALOG_CAPTURE_LINES};

/// First gain guess from the white level `at_zero` measured at gain 0.
#[must_use]
pub fn estimate_gain(at_zero: f64, targets: &CalibrationTargets) -> u8 {
    let target = (f64::from(targets.white_low) + f64::from(targets.white_high)) / 2.0;
    let guess = (1.0 - at_zero / target) * f64::from(targets.gain_max) * 6.0 / 5.0;
    guess.round().clamp(0.0, f64::from(targets.gain_max)) as u8
}

/// One-code step toward the white window, or `None` when inside it or
/// pinned at a bound.
#[must_use]
pub fn step_gain(current: u8, mean: f64, targets: &CalibrationTargets) -> Option<u8> {
    if mean < f64::from(targets.white_low) {
        (current < targets.gain_max).then(|| current + 1)
    } else if mean > f64::from(targets.white_high) {
        current.checked_sub(1)
    } else {
        None
    }
}

/// Bring the central half of a white line into `[white_low, white_high]`.
pub fn calibrate_gain(
    scanner: &mut dyn CalibrationScanner,
    params: &mut AnalogParams,
    sensor: &SensorProfile,
    targets: &CalibrationTargets,
) -> Result<Outcome> {
    let active = active_band(sensor);
    let quarter = active.len() / 4;
    let central = active.start + quarter..active.end - quarter;

    params.gain = [0; 3];
    let capture = scanner.capture(params, true, ANALOG_CAPTURE_LINES, 8)?;
    let at_zero = capture.band_means(central.clone());
    for channel in 0..3 {
        params.gain[channel] = estimate_gain(at_zero[channel], targets);
    }
    debug!(?at_zero, gain = ?params.gain, "Gain estimate");

    let mut iterations = 1;
    while iterations < targets.gain_iterations {
        iterations += 1;
        let capture = scanner.capture(params, true, ANALOG_CAPTURE_LINES, 8)?;
        let means = capture.band_means(central.clone());
        debug!(iterations, ?means, gain = ?params.gain, "Gain capture");

        // judged on this capture alone; a channel that drifts out moves again
        let mut inside = [false; 3];
        let mut settled = [false; 3];
        for channel in 0..3 {
            let mean = means[channel];
            inside[channel] =
                mean >= f64::from(targets.white_low) && mean <= f64::from(targets.white_high);
            match step_gain(params.gain[channel], mean, targets) {
                Some(next) => params.gain[channel] = next,
                None => settled[channel] = true,
            }
        }
        if inside.iter().all(|&i| i) {
            return Ok(Outcome::Converged { iterations });
        }
        if settled.iter().all(|&s| s) {
            // every channel pinned at a bound
            break;
        }
    }
    for gain in &mut params.gain {
        *gain = (*gain).min(targets.gain_max);
    }
    Ok(Outcome::CapReached { iterations })
}
