//! Raw device lines to client scan lines.
//!
//! Raw lines are pixel-interleaved, channels in R, G, B order, 16-bit
//! samples little-endian. Output line `k` reads raw lines up to
//! `k + lead_lines`; the caller may release everything below `k + 1` once
//! line `k` is returned.

use std::sync::Arc;

use scan_core::{ColorOrder, DualRowPhase, Result, ScanError, ScanFlags, ScanSetup};

use crate::gamma::GammaTables;

/// One reconstructed client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanLine {
    /// Zero-based line number within the scan.
    pub index: u64,
    /// Packed samples, `bytes_per_line` long.
    pub data: Vec<u8>,
}

/// Stateful reconstructor for one scan.
#[derive(Debug)]
pub struct LineReconstructor {
    setup: ScanSetup,
    gamma: Option<Arc<GammaTables>>,
    next: u64,
    previous: Option<Vec<u16>>,
}

struct RawLines {
    lines: Vec<(u64, Vec<u8>)>,
    sample_bytes: usize,
    channels: usize,
}

impl RawLines {
    fn sample(&self, line: u64, pixel: usize, channel: usize) -> u16 {
        let Some((_, raw)) = self.lines.iter().find(|(i, _)| *i == line) else {
            return 0;
        };
        let offset = (pixel * self.channels + channel) * self.sample_bytes;
        if self.sample_bytes == 2 {
            u16::from_le_bytes([raw[offset], raw[offset + 1]])
        } else {
            u16::from(raw[offset])
        }
    }
}

impl LineReconstructor {
    /// Reconstructor for `setup`. `gamma` is applied unless the setup
    /// disables it, the output is lineart, or its depth does not match the
    /// raw depth.
    #[must_use]
    pub fn new(setup: ScanSetup, gamma: Option<Arc<GammaTables>>) -> Self {
        let gamma = gamma.filter(|g| {
            !setup.flags.contains(ScanFlags::DISABLE_GAMMA)
                && setup.depth != 1
                && g.bits() == setup.raw_depth
        });
        Self {
            setup,
            gamma,
            next: 0,
            previous: None,
        }
    }

    /// Geometry this reconstructor works on.
    #[must_use]
    pub fn setup(&self) -> &ScanSetup {
        &self.setup
    }

    /// Index of the next line to produce.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Lines still to produce.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        u64::from(self.setup.lines).saturating_sub(self.next)
    }

    /// Highest raw line that output line `index` reads.
    #[must_use]
    pub fn last_raw_for(&self, index: u64) -> u64 {
        index + u64::from(self.setup.lead_lines)
    }

    /// Raw line holding channel `channel` of output line `index`.
    fn channel_base(&self, index: u64, channel: usize) -> u64 {
        self.last_raw_for(index) - channel as u64 * u64::from(self.setup.line_distance)
    }

    fn lags(&self, pixel: usize) -> bool {
        match self.setup.dual_row_phase {
            DualRowPhase::EvenLags => pixel % 2 == 0,
            DualRowPhase::OddLags => pixel % 2 == 1,
        }
    }

    fn row_line(&self, base: u64, pixel: usize) -> u64 {
        let pd = u64::from(self.setup.pixel_distance);
        if pd > 0 && self.lags(pixel) {
            base - pd
        } else {
            base
        }
    }

    /// Produce the next line, pulling raw lines through `fetch`.
    pub fn reconstruct<F>(&mut self, mut fetch: F) -> Result<ScanLine>
    where
        F: FnMut(u64) -> Result<Vec<u8>>,
    {
        if self.remaining() == 0 {
            return Err(ScanError::InvalidState {
                expected: "lines remaining",
                actual: format!("all {} lines produced", self.setup.lines),
            });
        }
        let index = self.next;
        let channels = usize::from(self.setup.channels);
        let pd = u64::from(self.setup.pixel_distance);

        let mut wanted: Vec<u64> = Vec::with_capacity(2 * channels);
        for channel in 0..channels {
            let base = self.channel_base(index, channel);
            wanted.push(base);
            if pd > 0 {
                wanted.push(base - pd);
            }
        }
        wanted.sort_unstable();
        wanted.dedup();

        let mut raw = RawLines {
            lines: Vec::with_capacity(wanted.len()),
            sample_bytes: usize::from(self.setup.raw_depth / 8),
            channels,
        };
        for line in wanted {
            let bytes = fetch(line)?;
            if bytes.len() != self.setup.raw_bytes_per_line {
                return Err(ScanError::invalid(
                    "raw_line",
                    format!(
                        "line {line} has {} bytes, expected {}",
                        bytes.len(),
                        self.setup.raw_bytes_per_line
                    ),
                ));
            }
            raw.lines.push((line, bytes));
        }

        let mut samples = self.deinterleave(index, &raw);
        self.fix_edges(&mut samples);
        let data = self.pack(&samples);
        self.previous = Some(samples);
        self.next += 1;
        Ok(ScanLine { index, data })
    }

    /// Aligned samples, `pixels * channels`, channels in R, G, B order.
    fn deinterleave(&self, index: u64, raw: &RawLines) -> Vec<u16> {
        let pixels = self.setup.pixels as usize;
        let channels = usize::from(self.setup.channels);
        let dual_row = self.setup.pixel_distance > 0;
        let mut out = vec![0u16; pixels * channels];
        for channel in 0..channels {
            let base = self.channel_base(index, channel);
            for pixel in 0..pixels {
                let own = raw.sample(self.row_line(base, pixel), pixel, channel);
                let value = if dual_row && pixel + 1 < pixels {
                    let neighbor =
                        raw.sample(self.row_line(base, pixel + 1), pixel + 1, channel);
                    ((u32::from(own) + u32::from(neighbor)) / 2) as u16
                } else {
                    own
                };
                out[pixel * channels + channel] = value;
            }
        }
        out
    }

    /// Blend the trailing columns of dual-row scans with the previous line.
    fn fix_edges(&self, samples: &mut [u16]) {
        let pixels = self.setup.pixels as usize;
        let edge = (self.setup.edge_columns as usize).min(pixels.saturating_sub(1));
        if self.setup.pixel_distance == 0 || edge == 0 {
            return;
        }
        let channels = usize::from(self.setup.channels);
        for i in (1..=edge).rev() {
            let col = pixels - i;
            for channel in 0..channels {
                let here = col * channels + channel;
                let left = u32::from(samples[here - channels]);
                let above = self
                    .previous
                    .as_ref()
                    .map_or(samples[here], |prev| prev[here]);
                samples[here] = ((left + u32::from(above)) / 2) as u16;
            }
        }
    }

    fn map(&self, channel: usize, sample: u16) -> u16 {
        match &self.gamma {
            Some(g) => g.lookup(channel, sample),
            None => sample,
        }
    }

    fn pack(&self, samples: &[u16]) -> Vec<u8> {
        let channels = usize::from(self.setup.channels);
        let order: [usize; 3] = match (channels, self.setup.color_order) {
            (3, ColorOrder::Bgr) => [2, 1, 0],
            _ => [0, 1, 2],
        };
        let mono_channel = self.setup.color_filter.index();
        let gamma_channel = |c: usize| if channels == 1 { mono_channel } else { c };

        match self.setup.depth {
            1 => self.binarize(samples),
            16 => {
                let mut out = Vec::with_capacity(samples.len() * 2);
                for pixel in samples.chunks_exact(channels) {
                    for &c in &order[..channels] {
                        let v = self.map(gamma_channel(c), pixel[c]);
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                out
            }
            _ => {
                let mut out = Vec::with_capacity(samples.len());
                for pixel in samples.chunks_exact(channels) {
                    for &c in &order[..channels] {
                        out.push(self.map(gamma_channel(c), pixel[c]).min(255) as u8);
                    }
                }
                out
            }
        }
    }

    /// One bit per pixel, most significant first, set for black.
    fn binarize(&self, samples: &[u16]) -> Vec<u8> {
        let width = samples.len();
        let mut out = vec![0u8; self.setup.bytes_per_line];
        let line: Vec<u8> = samples.iter().map(|&s| s.min(255) as u8).collect();

        let thresholds: Vec<u8> = if self.setup.flags.contains(ScanFlags::DYNAMIC_LINEART) {
            dynamic_thresholds(&line, self.setup.resolution, self.setup.lineart_threshold)
        } else {
            vec![self.setup.lineart_threshold; width]
        };
        for (x, (&v, &t)) in line.iter().zip(&thresholds).enumerate() {
            if v <= t {
                out[x / 8] |= 0x80 >> (x % 8);
            }
        }
        out
    }
}

/// Sliding-window lineart threshold: local mean of the contrast-stretched
/// line, shifted by `threshold - 128`.
fn dynamic_thresholds(line: &[u8], resolution: u16, threshold: u8) -> Vec<u8> {
    let width = line.len();
    if width == 0 {
        return Vec::new();
    }
    let mut min = line.iter().copied().min().unwrap_or(0);
    let mut max = line.iter().copied().max().unwrap_or(255);
    if min > 80 {
        min = 0;
    }
    if max < 80 {
        max = 255;
    }
    let span = u32::from(max.saturating_sub(min)).max(1);
    let stretched: Vec<u32> = line
        .iter()
        .map(|&v| (u32::from(v.saturating_sub(min)) * 255 / span).min(255))
        .collect();

    let window = ((6 * usize::from(resolution) / 150).max(3) | 1).min(width.max(1) | 1);
    let half = window / 2;
    let bias = i32::from(threshold) - 128;
    let mut prefix = vec![0u32; width + 1];
    for (i, v) in stretched.iter().enumerate() {
        prefix[i + 1] = prefix[i] + v;
    }
    (0..width)
        .map(|x| {
            let lo = x.saturating_sub(half);
            let hi = (x + half + 1).min(width);
            let mean = (prefix[hi] - prefix[lo]) / (hi - lo) as u32;
            // thresholds apply to the raw sample, so undo the stretch
            let raw_mean = u32::from(min) + mean * span / 255;
            (raw_mean as i32 + bias).clamp(0, 255) as u8
        })
        .collect()
}
