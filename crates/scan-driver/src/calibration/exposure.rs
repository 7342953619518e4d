//! Exposure calibration.

use scan_core::{CalibrationTargets, Result, SensorProfile};
use tracing::debug;

use super::{active_band, AnalogParams, CalibrationScanner, Outcome, ANALOG_CAPTURE_LINES};

/// Next exposure for a channel measuring `mean`, or `None` when inside
/// `[led_low, led_high]`.
#[must_use]
pub fn next_exposure(current: u16, mean: f64, targets: &CalibrationTargets) -> Option<u16> {
    let low = f64::from(targets.led_low);
    let high = f64::from(targets.led_high);
    if (low..=high).contains(&mean) {
        return None;
    }
    let target = (low + high) / 2.0;
    let scaled = f64::from(current) * target / mean.max(1.0);
    let next = scaled
        .round()
        .clamp(f64::from(targets.exposure_min), f64::from(targets.exposure_max)) as u16;
    Some(next)
}

/// Rescale each channel's exposure until a full white line averages inside
/// the LED window.
pub fn calibrate_exposure(
    scanner: &mut dyn CalibrationScanner,
    params: &mut AnalogParams,
    sensor: &SensorProfile,
    targets: &CalibrationTargets,
) -> Result<Outcome> {
    let band = active_band(sensor);
    let mut iterations = 0;
    while iterations < targets.exposure_iterations {
        iterations += 1;
        let capture = scanner.capture(params, true, ANALOG_CAPTURE_LINES, 8)?;
        let means = capture.band_means(band.clone());
        debug!(iterations, ?means, exposure = ?params.exposure, "Exposure capture");

        let mut settled = true;
        for channel in 0..3 {
            if let Some(next) = next_exposure(params.exposure[channel], means[channel], targets) {
                settled = false;
                params.exposure[channel] = next;
            }
        }
        if settled {
            return Ok(Outcome::Converged { iterations });
        }
    }
    Ok(Outcome::CapReached { iterations })
}
