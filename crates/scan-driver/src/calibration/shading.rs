//! Shading calibration: per-column dark level and white coefficient.
//!
//! Corrected output is `(raw - dark) * coeff / unity`; the coefficient is
//! chosen so the white reference lands on [`SHADING_TARGET`].

use scan_core::{AddressWindow, CalibrationTargets, RamTarget, Result, ScanSetup, SensorProfile};
use tracing::{debug, instrument};

use super::{AnalogParams, CalibrationScanner, RawCapture};
use crate::channel::CommandChannel;

/// 16-bit level the white reference maps to.
pub const SHADING_TARGET: u32 = 0xfa00;

/// Bytes per pixel in shading RAM: dark then coefficient, three channels.
pub const SHADING_ENTRY_BYTES: usize = 12;

/// Per-column correction, one entry per sensor column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadingTable {
    unity: u16,
    dark: Vec<[u16; 3]>,
    coeff: Vec<[u16; 3]>,
}

/// Mean of the samples ranked `[low, high)` from the top.
fn ranked_mean(mut samples: Vec<u16>, low: usize, high: usize) -> u32 {
    samples.sort_unstable_by(|a, b| b.cmp(a));
    let high = high.min(samples.len());
    let low = low.min(high.saturating_sub(1));
    let band = &samples[low..high];
    if band.is_empty() {
        return 0;
    }
    (band.iter().map(|&v| u64::from(v)).sum::<u64>() / band.len() as u64) as u32
}

/// Coefficient mapping `white - dark` onto the target level.
#[must_use]
pub fn coefficient(white: u32, dark: u32, unity: u16) -> u16 {
    if white <= dark {
        return unity;
    }
    let coeff = u64::from(unity) * u64::from(SHADING_TARGET) / u64::from(white - dark);
    coeff.min(u64::from(u16::MAX)) as u16
}

impl ShadingTable {
    /// Table that leaves data unchanged.
    #[must_use]
    pub fn unity(pixels: usize, unity: u16) -> Self {
        Self {
            unity,
            dark: vec![[0; 3]; pixels],
            coeff: vec![[unity; 3]; pixels],
        }
    }

    /// Combine a lamp-off and a lamp-on capture.
    ///
    /// The dark level is averaged over the whole line per channel, separately
    /// for even and odd columns on dual-row sensors.
    #[must_use]
    pub fn from_captures(
        dark: &RawCapture,
        white: &RawCapture,
        targets: &CalibrationTargets,
        dual_row: bool,
    ) -> Self {
        let pixels = dark.pixels.min(white.pixels);
        let mut dark_level = [[0u32; 3]; 2];
        for channel in 0..dark.channels.min(3) {
            let mut sums = [0u64; 2];
            let mut counts = [0u64; 2];
            for pixel in 0..pixels {
                let row = if dual_row { pixel % 2 } else { 0 };
                for v in dark.column(pixel, channel) {
                    sums[row] += u64::from(v);
                    counts[row] += 1;
                }
            }
            for row in 0..2 {
                let source = if dual_row { row } else { 0 };
                dark_level[row][channel] = (sums[source] / counts[source].max(1)) as u32;
            }
        }

        let low = targets.shading_filter_low as usize;
        let high = targets.shading_filter_high as usize;
        let mut dark_out = Vec::with_capacity(pixels);
        let mut coeff_out = Vec::with_capacity(pixels);
        for pixel in 0..pixels {
            let row = if dual_row { pixel % 2 } else { 0 };
            let mut d = [0u16; 3];
            let mut c = [targets.shading_unity; 3];
            for channel in 0..white.channels.min(3) {
                let white_level = ranked_mean(white.column(pixel, channel).collect(), low, high);
                let dark_value = dark_level[row][channel];
                d[channel] = dark_value.min(u32::from(u16::MAX)) as u16;
                c[channel] = coefficient(white_level, dark_value, targets.shading_unity);
            }
            dark_out.push(d);
            coeff_out.push(c);
        }
        Self {
            unity: targets.shading_unity,
            dark: dark_out,
            coeff: coeff_out,
        }
    }

    /// Columns covered.
    #[must_use]
    pub fn pixels(&self) -> usize {
        self.dark.len()
    }

    /// Dark level and coefficient of `pixel`.
    #[must_use]
    pub fn entry(&self, pixel: usize) -> Option<([u16; 3], [u16; 3])> {
        Some((*self.dark.get(pixel)?, *self.coeff.get(pixel)?))
    }

    /// Resample to the columns `setup` reads: `ratio` optical columns per
    /// output pixel starting at `start_pixel`, averaged.
    #[must_use]
    pub fn for_setup(&self, setup: &ScanSetup, optical_dpi: u16) -> Self {
        let ratio = usize::from(optical_dpi / setup.resolution.max(1)).max(1);
        let start = setup.start_pixel as usize;
        let last = self.pixels().saturating_sub(1);
        let mut dark = Vec::with_capacity(setup.pixels as usize);
        let mut coeff = Vec::with_capacity(setup.pixels as usize);
        for pixel in 0..setup.pixels as usize {
            let first = start + pixel * ratio;
            let mut d = [0u32; 3];
            let mut c = [0u32; 3];
            for col in first..first + ratio {
                let col = col.min(last);
                for channel in 0..3 {
                    d[channel] += u32::from(self.dark.get(col).map_or(0, |e| e[channel]));
                    c[channel] += u32::from(self.coeff.get(col).map_or(self.unity, |e| e[channel]));
                }
            }
            let n = ratio as u32;
            dark.push(d.map(|v| (v / n) as u16));
            coeff.push(c.map(|v| (v / n) as u16));
        }
        Self {
            unity: self.unity,
            dark,
            coeff,
        }
    }

    /// Shading RAM image: per pixel, per channel, dark then coefficient,
    /// little-endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels() * SHADING_ENTRY_BYTES);
        for (dark, coeff) in self.dark.iter().zip(&self.coeff) {
            for channel in 0..3 {
                out.extend_from_slice(&dark[channel].to_le_bytes());
                out.extend_from_slice(&coeff[channel].to_le_bytes());
            }
        }
        out
    }

    /// Write the table to shading RAM.
    pub fn upload(&self, channel: &dyn CommandChannel) -> Result<()> {
        let window = AddressWindow::Ram {
            target: RamTarget::Shading,
            start: 0,
        };
        channel.bulk_write(window, &self.to_bytes())?;
        Ok(())
    }
}

/// Capture the dark and white references and build the table.
#[instrument(skip_all, fields(lines = targets.shading_lines))]
pub fn calibrate_shading(
    scanner: &mut dyn CalibrationScanner,
    params: &AnalogParams,
    sensor: &SensorProfile,
    targets: &CalibrationTargets,
) -> Result<ShadingTable> {
    let lines = targets.shading_lines.max(1);
    let dark = scanner.capture(params, false, lines, 16)?;
    let white = scanner.capture(params, true, lines, 16)?;
    let table = ShadingTable::from_captures(&dark, &white, targets, sensor.dual_row_distance > 0);
    debug!(pixels = table.pixels(), "Shading table built");
    Ok(table)
}
