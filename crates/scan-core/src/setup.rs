//! Scan requests and the derived geometry the pipeline runs on.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::profile::{ColorOrder, DualRowPhase, ModelProfile};

bitflags! {
    /// Per-scan behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ScanFlags: u16 {
        /// Do not apply shading coefficients.
        const DISABLE_SHADING = 0x0001;
        /// Do not apply the gamma table.
        const DISABLE_GAMMA = 0x0002;
        /// Carriage stays put; channel and row offsets are not compensated.
        const SINGLE_LINE = 0x0004;
        /// Move the medium without capturing.
        const FEED_ONLY = 0x0008;
        /// Lineart threshold follows the local mean instead of a constant.
        const DYNAMIC_LINEART = 0x0010;
        /// Capture with the lamp off.
        const LAMP_OFF = 0x0020;
        /// Move backwards.
        const REVERSE = 0x0040;
    }
}

/// Channel captured by a single-channel scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFilter {
    /// Red.
    Red,
    /// Green.
    #[default]
    Green,
    /// Blue.
    Blue,
}

impl ColorFilter {
    /// Channel index in R, G, B order.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Red => 0,
            Self::Green => 1,
            Self::Blue => 2,
        }
    }
}

/// Bytes in one packed output line.
#[must_use]
pub fn bytes_per_line(pixels: u32, channels: u8, depth: u8) -> usize {
    let bits = u64::from(pixels) * u64::from(channels) * u64::from(depth);
    bits.div_ceil(8) as usize
}

/// A client scan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Horizontal and vertical resolution.
    pub resolution: u16,
    /// Left edge in pixels at `resolution`.
    pub x_origin: u32,
    /// Lines to travel before capture, at `resolution`.
    pub y_origin: u32,
    /// Pixels per line.
    pub pixels: u32,
    /// Lines to deliver.
    pub lines: u32,
    /// Output bit depth: 1, 8 or 16.
    pub depth: u8,
    /// Output channels: 1 or 3.
    pub channels: u8,
    /// Channel used by single-channel scans.
    pub color_filter: ColorFilter,
    /// Behavior switches.
    pub flags: ScanFlags,
    /// Fixed lineart threshold.
    pub lineart_threshold: u8,
}

impl ScanRequest {
    /// Start building a request.
    #[must_use]
    pub fn builder() -> ScanRequestBuilder {
        ScanRequestBuilder::default()
    }
}

/// Builder for [`ScanRequest`].
#[derive(Debug, Clone)]
pub struct ScanRequestBuilder {
    request: ScanRequest,
}

impl Default for ScanRequestBuilder {
    fn default() -> Self {
        Self {
            request: ScanRequest {
                resolution: 300,
                x_origin: 0,
                y_origin: 0,
                pixels: 0,
                lines: 0,
                depth: 8,
                channels: 1,
                color_filter: ColorFilter::Green,
                flags: ScanFlags::empty(),
                lineart_threshold: 128,
            },
        }
    }
}

impl ScanRequestBuilder {
    /// Resolution in dpi.
    #[must_use]
    pub fn resolution(mut self, dpi: u16) -> Self {
        self.request.resolution = dpi;
        self
    }

    /// Top-left corner at the scan resolution.
    #[must_use]
    pub fn origin(mut self, x: u32, y: u32) -> Self {
        self.request.x_origin = x;
        self.request.y_origin = y;
        self
    }

    /// Size of the scan area.
    #[must_use]
    pub fn area(mut self, pixels: u32, lines: u32) -> Self {
        self.request.pixels = pixels;
        self.request.lines = lines;
        self
    }

    /// Output depth.
    #[must_use]
    pub fn depth(mut self, depth: u8) -> Self {
        self.request.depth = depth;
        self
    }

    /// Three-channel color.
    #[must_use]
    pub fn color(mut self) -> Self {
        self.request.channels = 3;
        self
    }

    /// Single channel through `filter`.
    #[must_use]
    pub fn gray(mut self, filter: ColorFilter) -> Self {
        self.request.channels = 1;
        self.request.color_filter = filter;
        self
    }

    /// Add flags.
    #[must_use]
    pub fn flags(mut self, flags: ScanFlags) -> Self {
        self.request.flags |= flags;
        self
    }

    /// Fixed lineart threshold.
    #[must_use]
    pub fn threshold(mut self, threshold: u8) -> Self {
        self.request.lineart_threshold = threshold;
        self
    }

    /// Finish without profile validation; see [`ScanSetup::resolve`].
    #[must_use]
    pub fn build(self) -> ScanRequest {
        self.request
    }
}

/// Fully derived geometry for one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSetup {
    /// Resolution.
    pub resolution: u16,
    /// First sensor pixel read, at optical resolution.
    pub start_pixel: u32,
    /// Pixels per line.
    pub pixels: u32,
    /// Lines delivered to the client.
    pub lines: u32,
    /// Lines travelled before capture.
    pub y_origin: u32,
    /// Output depth.
    pub depth: u8,
    /// Output channels.
    pub channels: u8,
    /// Channel for single-channel scans.
    pub color_filter: ColorFilter,
    /// Output channel order.
    pub color_order: ColorOrder,
    /// Switches.
    pub flags: ScanFlags,
    /// Fixed lineart threshold.
    pub lineart_threshold: u8,
    /// Depth the device delivers: 8 or 16.
    pub raw_depth: u8,
    /// Bytes per packed output line.
    pub bytes_per_line: usize,
    /// Bytes per raw device line.
    pub raw_bytes_per_line: usize,
    /// Line offset between consecutive channels.
    pub line_distance: u32,
    /// Line offset between sensor rows.
    pub pixel_distance: u32,
    /// Which row lags.
    pub dual_row_phase: DualRowPhase,
    /// Columns patched from the previous line on dual-row scans.
    pub edge_columns: u32,
    /// Raw lines consumed before the first complete output line.
    pub lead_lines: u32,
    /// Raw lines the device must deliver.
    pub raw_lines: u32,
}

impl ScanSetup {
    /// Validate `request` against `profile` and derive the scan geometry.
    pub fn resolve(request: &ScanRequest, profile: &ModelProfile) -> Result<Self> {
        let sensor = &profile.sensor;

        if !sensor.supports(request.resolution) {
            return Err(ScanError::invalid(
                "resolution",
                format!(
                    "{} dpi not in {:?}",
                    request.resolution, sensor.resolutions
                ),
            ));
        }
        if !matches!(request.depth, 1 | 8 | 16) {
            return Err(ScanError::invalid(
                "depth",
                format!("{} is not 1, 8 or 16", request.depth),
            ));
        }
        if !matches!(request.channels, 1 | 3) {
            return Err(ScanError::invalid(
                "channels",
                format!("{} is not 1 or 3", request.channels),
            ));
        }
        if request.depth == 1 && request.channels != 1 {
            return Err(ScanError::invalid("depth", "lineart requires one channel"));
        }
        let feed_only = request.flags.contains(ScanFlags::FEED_ONLY);
        if !feed_only && (request.pixels == 0 || request.lines == 0) {
            return Err(ScanError::invalid(
                "area",
                format!("{}x{} is empty", request.pixels, request.lines),
            ));
        }
        let width = sensor.pixels_at(request.resolution);
        if u64::from(request.x_origin) + u64::from(request.pixels) > u64::from(width) {
            return Err(ScanError::invalid(
                "area",
                format!(
                    "x {} + {} pixels exceeds sensor width {width}",
                    request.x_origin, request.pixels
                ),
            ));
        }

        let single_line = request.flags.contains(ScanFlags::SINGLE_LINE);
        let ratio = u32::from(sensor.optical_dpi / request.resolution.max(1)).max(1);

        let line_distance = if request.channels == 3 && !single_line {
            let scaled = u32::from(sensor.line_distance) * u32::from(request.resolution);
            (scaled + u32::from(sensor.optical_dpi) / 2) / u32::from(sensor.optical_dpi)
        } else {
            0
        };
        let pixel_distance = if request.resolution == sensor.optical_dpi && !single_line {
            u32::from(sensor.dual_row_distance)
        } else {
            0
        };
        let edge_columns = if pixel_distance > 0 {
            u32::from(sensor.edge_columns).min(request.pixels)
        } else {
            0
        };
        let lead_lines = 2 * line_distance + pixel_distance;
        let raw_lines = if feed_only {
            0
        } else {
            request.lines.checked_add(lead_lines).ok_or_else(|| {
                ScanError::invalid(
                    "area",
                    format!("{} lines plus {lead_lines} lead lines overflow", request.lines),
                )
            })?
        };
        let raw_depth = if request.depth == 16 { 16 } else { 8 };
        let raw_bytes_per_line = request.pixels as usize
            * usize::from(request.channels)
            * usize::from(raw_depth / 8);

        Ok(Self {
            resolution: request.resolution,
            start_pixel: sensor.first_active_pixel + request.x_origin * ratio,
            pixels: request.pixels,
            lines: request.lines,
            y_origin: request.y_origin,
            depth: request.depth,
            channels: request.channels,
            color_filter: request.color_filter,
            color_order: sensor.color_order,
            flags: request.flags,
            lineart_threshold: request.lineart_threshold,
            raw_depth,
            bytes_per_line: bytes_per_line(request.pixels, request.channels, request.depth),
            raw_bytes_per_line,
            line_distance,
            pixel_distance,
            dual_row_phase: sensor.dual_row_phase,
            edge_columns,
            lead_lines,
            raw_lines,
        })
    }

    /// Stationary full-sensor capture at optical resolution, masked margin
    /// included, for calibration. Column `i` is sensor pixel `i`.
    #[must_use]
    pub fn calibration(profile: &ModelProfile, depth: u8, lines: u32, flags: ScanFlags) -> Self {
        let sensor = &profile.sensor;
        let pixels = sensor.first_active_pixel + sensor.pixels;
        let raw_depth = if depth == 16 { 16 } else { 8 };
        let flags = flags | ScanFlags::SINGLE_LINE | ScanFlags::DISABLE_SHADING | ScanFlags::DISABLE_GAMMA;
        Self {
            resolution: sensor.optical_dpi,
            start_pixel: 0,
            pixels,
            lines,
            y_origin: 0,
            depth: raw_depth,
            channels: 3,
            color_filter: ColorFilter::Green,
            color_order: ColorOrder::Rgb,
            flags,
            lineart_threshold: 128,
            raw_depth,
            bytes_per_line: bytes_per_line(pixels, 3, raw_depth),
            raw_bytes_per_line: bytes_per_line(pixels, 3, raw_depth),
            line_distance: 0,
            pixel_distance: 0,
            dual_row_phase: sensor.dual_row_phase,
            edge_columns: 0,
            lead_lines: 0,
            raw_lines: lines,
        }
    }

    /// Total bytes delivered to the client.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.bytes_per_line * self.lines as usize
    }

    /// True when the device captures nothing.
    #[must_use]
    pub fn feed_only(&self) -> bool {
        self.flags.contains(ScanFlags::FEED_ONLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileRegistry;
    use proptest::prelude::*;

    fn profile(model: &str) -> ModelProfile {
        ProfileRegistry::builtin()
            .unwrap()
            .get(model)
            .unwrap()
            .as_ref()
            .clone()
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    #[test]
    fn test_gray_8bit_geometry() {
        let req = ScanRequest::builder().resolution(300).area(100, 100).build();
        let setup = ScanSetup::resolve(&req, &profile("cp1200")).unwrap();
        assert_eq!(setup.bytes_per_line, 100);
        assert_eq!(setup.raw_bytes_per_line, 100);
        assert_eq!(setup.line_distance, 0);
        assert_eq!(setup.pixel_distance, 0);
        assert_eq!(setup.raw_lines, 100);
    }

    #[test]
    fn test_color_line_distance_scales() {
        let req = ScanRequest::builder()
            .resolution(600)
            .area(64, 10)
            .color()
            .build();
        let setup = ScanSetup::resolve(&req, &profile("cp1200")).unwrap();
        assert_eq!(setup.line_distance, 4);
        assert_eq!(setup.lead_lines, 8);
        assert_eq!(setup.raw_lines, 18);
    }

    #[test]
    fn test_line_count_overflow_is_rejected() {
        let req = ScanRequest::builder()
            .resolution(600)
            .area(64, u32::MAX)
            .color()
            .build();
        let err = ScanSetup::resolve(&req, &profile("cp1200")).unwrap_err();
        assert!(matches!(err, ScanError::InvalidParameter { name: "area", .. }), "{err:?}");

        // no lead lines, so the full range fits
        let req = ScanRequest::builder().resolution(600).area(64, u32::MAX).build();
        let setup = ScanSetup::resolve(&req, &profile("cp1200")).unwrap();
        assert_eq!(setup.raw_lines, u32::MAX);
    }

    #[test]
    fn test_dual_row_only_at_optical() {
        let req = ScanRequest::builder()
            .resolution(1200)
            .area(64, 10)
            .color()
            .build();
        let setup = ScanSetup::resolve(&req, &profile("cp1200")).unwrap();
        assert_eq!(setup.line_distance, 8);
        assert_eq!(setup.pixel_distance, 4);
        assert_eq!(setup.lead_lines, 20);
        assert_eq!(setup.edge_columns, 4);
    }

    #[test]
    fn test_lineart_geometry() {
        let req = ScanRequest::builder()
            .resolution(300)
            .area(100, 5)
            .depth(1)
            .build();
        let setup = ScanSetup::resolve(&req, &profile("bh1200")).unwrap();
        assert_eq!(setup.bytes_per_line, 13);
        assert_eq!(setup.raw_depth, 8);
        assert_eq!(setup.raw_bytes_per_line, 100);
    }

    #[test]
    fn test_sixteen_bit_color_geometry() {
        let req = ScanRequest::builder()
            .resolution(150)
            .area(10, 2)
            .depth(16)
            .color()
            .build();
        let setup = ScanSetup::resolve(&req, &profile("bh1200")).unwrap();
        assert_eq!(setup.bytes_per_line, 60);
        assert_eq!(setup.raw_bytes_per_line, 60);
        assert_eq!(setup.total_bytes(), 120);
    }

    // =========================================================================
    // Rejections
    // =========================================================================

    #[test]
    fn test_rejects_unsupported_resolution() {
        let req = ScanRequest::builder().resolution(400).area(10, 10).build();
        let err = ScanSetup::resolve(&req, &profile("cp1200")).unwrap_err();
        assert!(matches!(err, ScanError::InvalidParameter { name: "resolution", .. }));
    }

    #[test]
    fn test_rejects_color_lineart() {
        let req = ScanRequest::builder()
            .resolution(300)
            .area(10, 10)
            .depth(1)
            .color()
            .build();
        assert!(ScanSetup::resolve(&req, &profile("cp1200")).is_err());
    }

    #[test]
    fn test_rejects_area_past_sensor() {
        let p = profile("cp1200");
        let width = p.sensor.pixels_at(300);
        let req = ScanRequest::builder()
            .resolution(300)
            .origin(10, 0)
            .area(width, 1)
            .build();
        assert!(ScanSetup::resolve(&req, &p).is_err());
    }

    #[test]
    fn test_feed_only_needs_no_area() {
        let req = ScanRequest::builder()
            .resolution(150)
            .origin(0, 300)
            .flags(ScanFlags::FEED_ONLY)
            .build();
        let setup = ScanSetup::resolve(&req, &profile("cp1200")).unwrap();
        assert!(setup.feed_only());
        assert_eq!(setup.raw_lines, 0);
    }

    proptest! {
        #[test]
        fn prop_bytes_per_line_covers_bits(
            pixels in 1u32..20000,
            color in any::<bool>(),
            depth in prop::sample::select(vec![1u8, 8, 16]),
        ) {
            let channels = if color && depth != 1 { 3 } else { 1 };
            let bpl = bytes_per_line(pixels, channels, depth);
            let bits = pixels as usize * channels as usize * depth as usize;
            prop_assert!(bpl * 8 >= bits);
            prop_assert!(bpl * 8 < bits + 8);
        }
    }
}
