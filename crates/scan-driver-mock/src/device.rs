//! Simulated scanner behind a [`Transport`].
//!
//! The device decodes either framing family into a flat register file,
//! using the same [`RegisterMap`] the driver programs through. Scans latch
//! their geometry when scan-enable rises; lines are synthesized lazily from
//! a linear analog front end looking at a [`PageModel`], so a poll of the
//! valid-word counter is what "captures" more data.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use scan_core::protocol::bulk_header::{self, BulkHeader, Space};
use scan_core::protocol::control_packet;
use scan_core::registers::{clear_bits, lamp_bits, motor_bits, scan_bits};
use scan_core::{
    AsicFamily, BoxedTransport, ControlRequest, DualRowPhase, ModelProfile, MotionFlags,
    RamTarget, RegisterField, RegisterMap, Result, ScanError, StatusAccess, StatusFlags,
    TransferDirection, Transport,
};
use tracing::{debug, trace};

use crate::errors::ErrorConfig;
use crate::noise::SensorNoise;

const REGISTER_SPACE: usize = 0x400;

/// Relative response of the R, G, B rows.
const CHANNEL_SENSITIVITY: [f64; 3] = [0.95, 1.0, 1.05];

/// What lies on the glass, by carriage position.
#[derive(Debug, Clone, PartialEq)]
pub struct PageModel {
    /// Uniform white reference from the home position, in base steps.
    pub white_area: u32,
    /// Black strip, in base steps.
    pub strip: Range<u32>,
    /// Reflectance of the strip.
    pub strip_reflectance: f64,
    /// Light checkerboard squares of the document.
    pub paper: f64,
    /// Dark checkerboard squares of the document.
    pub ink: f64,
    /// Checkerboard cell, in optical pixels and base steps.
    pub cell: u32,
}

impl Default for PageModel {
    fn default() -> Self {
        Self {
            white_area: 300,
            strip: 800..1100,
            strip_reflectance: 0.02,
            paper: 0.9,
            ink: 0.15,
            cell: 96,
        }
    }
}

impl PageModel {
    /// Reflectance at optical column `x` and carriage position `y`.
    #[must_use]
    pub fn reflectance(&self, x: u32, y: f64) -> f64 {
        if y < f64::from(self.white_area) {
            return 1.0;
        }
        let row = y as u32;
        if self.strip.contains(&row) {
            return self.strip_reflectance;
        }
        let cell = self.cell.max(1);
        if (x / cell + row / cell) % 2 == 0 {
            self.paper
        } else {
            self.ink
        }
    }
}

/// Behavior knobs.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Seed for sensor noise; `None` draws from the OS.
    pub seed: Option<u64>,
    /// Peak noise amplitude in 8-bit units.
    pub noise: f64,
    /// Lines captured per counter poll.
    pub lines_per_poll: u32,
    /// Status polls before a move completes.
    pub move_polls: u32,
    /// Motion-status polls the data path stays busy after scan-enable drops.
    pub stop_polls: u32,
    /// Report power-good from the start; otherwise only after the first
    /// register write.
    pub powered: bool,
    /// Lit scans before the lamp reaches full brightness; zero starts warm.
    pub lamp_warmup_scans: u32,
    /// Page under the sensor.
    pub page: PageModel,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: Some(42),
            noise: 0.25,
            lines_per_poll: 8,
            move_polls: 2,
            stop_polls: 1,
            powered: true,
            lamp_warmup_scans: 0,
            page: PageModel::default(),
        }
    }
}

/// Geometry and analog settings latched when a scan starts.
#[derive(Debug, Clone)]
struct ScanRun {
    dpi: u16,
    start_pixel: u32,
    pixels: u32,
    channels: Vec<usize>,
    depth: u8,
    line_count: u32,
    exposure: [u16; 3],
    gain: [u8; 3],
    offset: [u8; 3],
    lamp: bool,
    /// Lamp output relative to a warm lamp.
    brightness: f64,
    shading: bool,
    reverse: bool,
    moving: bool,
    start_position: f64,
    line_distance: u32,
    pixel_distance: u32,
    captured: u32,
    generated: u32,
}

impl ScanRun {
    fn line_bytes(&self) -> usize {
        self.pixels as usize * self.channels.len() * usize::from(self.depth / 8)
    }

    fn finished(&self) -> bool {
        self.captured >= self.line_count
    }

    fn direction(&self) -> f64 {
        if self.reverse {
            -1.0
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MoveRun {
    polls_left: u32,
    steps: f64,
    reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusKind {
    Main,
    Motion,
}

struct DeviceState {
    profile: Arc<ModelProfile>,
    map: RegisterMap,
    config: SimulatorConfig,
    noise: SensorNoise,
    regs: Vec<u8>,
    powered: bool,

    bank: u8,
    latched_addr: u16,
    dma: Option<TransferDirection>,
    ram_cursor: (RamTarget, usize),
    header: Option<(BulkHeader, usize)>,
    counter_snapshot: Vec<(u16, u8)>,

    shading: Vec<u8>,
    gamma: Vec<u8>,
    slope: Vec<u8>,

    scan: Option<ScanRun>,
    fifo: VecDeque<u8>,
    position: f64,
    motion: Option<MoveRun>,
    feed_finished: bool,
    settle_polls: u32,
    lit_scans: u32,
}

impl DeviceState {
    fn new(profile: Arc<ModelProfile>, config: SimulatorConfig) -> Self {
        let map = RegisterMap::for_family(profile.family);
        Self {
            noise: SensorNoise::new(config.seed),
            powered: config.powered,
            map,
            profile,
            config,
            regs: vec![0; REGISTER_SPACE],
            bank: 0,
            latched_addr: 0,
            dma: None,
            ram_cursor: (RamTarget::Shading, 0),
            header: None,
            counter_snapshot: Vec::new(),
            shading: Vec::new(),
            gamma: Vec::new(),
            slope: Vec::new(),
            scan: None,
            fifo: VecDeque::new(),
            position: 0.0,
            motion: None,
            feed_finished: false,
            settle_polls: 0,
            lit_scans: 0,
        }
    }

    fn reg(&self, addr: u16) -> u8 {
        self.regs.get(usize::from(addr)).copied().unwrap_or(0)
    }

    fn field(&self, field: RegisterField) -> u32 {
        field.assemble(|addr| self.reg(addr))
    }

    fn bit(&self, field: RegisterField, mask: u8) -> bool {
        self.reg(field.addr) & mask != 0
    }

    /// Full steps encoded in the feed-steps register.
    fn feed_full_steps(&self) -> f64 {
        let shift = u32::from(self.reg(self.map.step_mode.addr) & 0x07);
        f64::from(self.field(self.map.feed_steps) >> shift)
    }

    fn at_home(&self) -> bool {
        !self.profile.sheetfed && self.position <= 0.5
    }

    // =========================================================================
    // Register file
    // =========================================================================

    fn write_register(&mut self, addr: u16, value: u8) {
        trace!(addr = format_args!("{addr:#06x}"), value, "Register write");
        self.powered = true;
        let old = self.reg(addr);
        if let Some(slot) = self.regs.get_mut(usize::from(addr)) {
            *slot = value;
        }

        if addr == self.map.scan_control.addr {
            let was = old & scan_bits::SCAN_ENABLE != 0;
            let now = value & scan_bits::SCAN_ENABLE != 0;
            match (was, now) {
                (false, true) => self.start_scan(),
                (true, false) => self.stop_scan(),
                _ => {}
            }
        } else if addr == self.map.start_motor.addr && value != 0 {
            self.start_motor();
        } else if addr == self.map.clear_counters.addr && value & clear_bits::LINE_COUNT != 0 {
            if let Some(scan) = self.scan.as_mut() {
                scan.captured = 0;
                scan.generated = 0;
            }
            self.fifo.clear();
        } else if self
            .map
            .host_start
            .is_some_and(|f| f.addresses().any(|a| a == addr))
        {
            self.rearm_ram_cursor();
        }
    }

    fn read_register(&mut self, addr: u16) -> u8 {
        if let Some(kind) = self.status_kind(addr) {
            return match kind {
                StatusKind::Main => self.read_status().bits(),
                StatusKind::Motion => self.read_motion().bits(),
            };
        }
        let counters = [self.map.valid_words, self.map.scan_count];
        for field in counters {
            if addr == field.addr {
                self.advance_scan();
                let value = if field == self.map.valid_words {
                    (self.data_available().div_ceil(2) as u32).min(field.max_value())
                } else {
                    self.scan.as_ref().map_or(0, |s| s.captured)
                };
                self.counter_snapshot = field.split(value.min(field.max_value())).unwrap_or_default();
            }
            if field.addresses().any(|a| a == addr) {
                return self
                    .counter_snapshot
                    .iter()
                    .find(|(a, _)| *a == addr)
                    .map_or(0, |(_, v)| *v);
            }
        }
        self.reg(addr)
    }

    fn status_kind(&self, addr: u16) -> Option<StatusKind> {
        let matches = |access: StatusAccess| match access {
            StatusAccess::Direct(a) => a == addr,
            StatusAccess::Selected { addr: a, selector } => a == addr && self.reg(a) == selector,
        };
        if matches(self.map.status) {
            Some(StatusKind::Main)
        } else if matches(self.map.motion_status) {
            Some(StatusKind::Motion)
        } else {
            None
        }
    }

    fn read_status(&mut self) -> StatusFlags {
        self.advance_move();
        let mut status = StatusFlags::empty();
        status.set(StatusFlags::POWER, self.powered);
        status.set(StatusFlags::BUFFER_EMPTY, self.data_available() == 0);
        status.set(StatusFlags::FEED_FINISHED, self.feed_finished);
        status.set(
            StatusFlags::SCAN_FINISHED,
            self.scan.as_ref().is_some_and(ScanRun::finished),
        );
        status.set(StatusFlags::HOME_SENSOR, self.at_home());
        status.set(
            StatusFlags::LAMP,
            self.bit(self.map.lamp, lamp_bits::LAMP_ON),
        );
        status.set(
            StatusFlags::MOTOR_ENABLED,
            self.bit(self.map.motor_control, motor_bits::MOTOR_ENABLE),
        );
        status
    }

    fn read_motion(&mut self) -> MotionFlags {
        let settling = self.settle_polls > 0;
        self.settle_polls = self.settle_polls.saturating_sub(1);
        let capturing = self.scan.as_ref().is_some_and(|s| !s.finished());
        let scan_moving = self.scan.as_ref().is_some_and(|s| s.moving && !s.finished());
        let mut flags = MotionFlags::empty();
        flags.set(MotionFlags::DATA_ENABLED, capturing || settling);
        flags.set(
            MotionFlags::MOTOR_MOVING,
            scan_moving || self.motion.is_some() || settling,
        );
        flags
    }

    // =========================================================================
    // Scan and motion
    // =========================================================================

    fn lamp_brightness(&self) -> f64 {
        match self.config.lamp_warmup_scans {
            0 => 1.0,
            warmup => (f64::from(self.lit_scans) / f64::from(warmup)).min(1.0),
        }
    }

    fn start_scan(&mut self) {
        let lamp = self.bit(self.map.lamp, lamp_bits::LAMP_ON);
        if lamp {
            self.lit_scans = self.lit_scans.saturating_add(1);
        }
        let brightness = self.lamp_brightness();
        let map = &self.map;
        let sensor = &self.profile.sensor;
        let dpi = (self.field(map.dpi) as u16).clamp(1, sensor.optical_dpi);
        let channel_reg = self.reg(map.channels.addr);
        let channels = if channel_reg & 0x0f == 3 {
            vec![0, 1, 2]
        } else {
            vec![usize::from(channel_reg >> 4).min(2)]
        };
        let line_distance = if channels.len() == 3 {
            (u32::from(sensor.line_distance) * u32::from(dpi) + u32::from(sensor.optical_dpi) / 2)
                / u32::from(sensor.optical_dpi)
        } else {
            0
        };
        let pixel_distance = if dpi == sensor.optical_dpi {
            u32::from(sensor.dual_row_distance)
        } else {
            0
        };
        let mut exposure = [0u16; 3];
        let mut gain = [0u8; 3];
        let mut offset = [0u8; 3];
        for channel in 0..3 {
            exposure[channel] = self.field(map.exposure[channel]) as u16;
            gain[channel] = self.reg(map.gain[channel].addr);
            offset[channel] = self.reg(map.offset[channel].addr);
        }
        let run = ScanRun {
            dpi,
            start_pixel: self.field(map.start_pixel),
            pixels: self.field(map.pixel_count),
            channels,
            depth: if self.reg(map.depth.addr) == 16 { 16 } else { 8 },
            line_count: self.field(map.line_count),
            exposure,
            gain,
            offset,
            lamp,
            brightness,
            shading: self.bit(map.scan_control, scan_bits::SHADING_ENABLE),
            reverse: self.bit(map.motor_control, motor_bits::REVERSE),
            moving: false,
            start_position: self.position,
            line_distance,
            pixel_distance,
            captured: 0,
            generated: 0,
        };
        debug!(
            dpi = run.dpi,
            pixels = run.pixels,
            lines = run.line_count,
            depth = run.depth,
            channels = run.channels.len(),
            "Simulated scan started"
        );
        self.fifo.clear();
        self.settle_polls = 0;
        self.scan = Some(run);
    }

    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            debug!(
                captured = scan.captured,
                generated = scan.generated,
                "Simulated scan stopped"
            );
        }
        self.settle_polls = self.config.stop_polls;
    }

    fn start_motor(&mut self) {
        let motor = self.reg(self.map.motor_control.addr);
        let feed = self.feed_full_steps();
        let position = self.position;
        if let Some(scan) = self.scan.as_mut() {
            scan.moving = true;
            if motor & motor_bits::FAST_FEED != 0 {
                scan.start_position = (position + scan.direction() * feed).max(0.0);
            }
            return;
        }
        if motor & motor_bits::MOTOR_ENABLE == 0 {
            return;
        }
        debug!(steps = feed, reverse = motor & motor_bits::REVERSE != 0, "Simulated move started");
        self.feed_finished = false;
        self.motion = Some(MoveRun {
            polls_left: self.config.move_polls,
            steps: feed,
            reverse: motor & motor_bits::REVERSE != 0,
        });
    }

    fn advance_move(&mut self) {
        let Some(run) = self.motion.as_mut() else {
            return;
        };
        if run.polls_left > 0 {
            run.polls_left -= 1;
            return;
        }
        let run = *run;
        self.motion = None;
        let delta = if run.reverse { -run.steps } else { run.steps };
        self.position = (self.position + delta).max(0.0);
        self.feed_finished = true;
        debug!(position = self.position, "Simulated move finished");
    }

    fn advance_scan(&mut self) {
        let step = self.config.lines_per_poll.max(1);
        let base_ydpi = f64::from(self.profile.motor.base_ydpi);
        let Some(scan) = self.scan.as_mut() else {
            return;
        };
        scan.captured = scan.captured.saturating_add(step).min(scan.line_count);
        if scan.moving {
            let travelled = f64::from(scan.captured) * base_ydpi / f64::from(scan.dpi);
            self.position = (scan.start_position + scan.direction() * travelled).max(0.0);
        }
    }

    fn data_available(&self) -> usize {
        let pending = self.scan.as_ref().map_or(0, |s| {
            s.captured.saturating_sub(s.generated) as usize * s.line_bytes()
        });
        self.fifo.len() + pending
    }

    // =========================================================================
    // Line synthesis
    // =========================================================================

    /// Carriage position seen by `channel` of `column` on raw line `line`.
    fn row_position(&self, scan: &ScanRun, column: usize, channel: usize, line: u32) -> f64 {
        if !scan.moving {
            return scan.start_position;
        }
        let lagging = scan.pixel_distance > 0
            && match self.profile.sensor.dual_row_phase {
                DualRowPhase::EvenLags => column % 2 == 0,
                DualRowPhase::OddLags => column % 2 == 1,
            };
        let channel_lag = if scan.channels.len() == 3 {
            (2 - channel.min(2)) as u32 * scan.line_distance
        } else {
            0
        };
        let row_lag = if lagging { 0 } else { scan.pixel_distance };
        let row = f64::from(line) - f64::from(channel_lag) - f64::from(row_lag);
        let step = f64::from(self.profile.motor.base_ydpi) / f64::from(scan.dpi);
        scan.start_position + scan.direction() * row * step
    }

    fn level(&self, scan: &ScanRun, column: usize, channel: usize, line: u32) -> f64 {
        let sensor = &self.profile.sensor;
        let ratio = u32::from(sensor.optical_dpi / scan.dpi).max(1);
        let pixel = scan.start_pixel + column as u32 * ratio;
        let offset = f64::from(scan.offset[channel]);
        let black = if self.profile.calibration.offset_raises_black {
            offset * 0.1
        } else {
            (255.0 - offset) * 0.1
        };
        let noise = self.noise.sample(self.config.noise);
        let active = (sensor.first_active_pixel..sensor.first_active_pixel + sensor.pixels)
            .contains(&pixel);
        if !scan.lamp || !active {
            return black + noise;
        }
        let gain = 76.0 / (76.0 - f64::from(scan.gain[channel].min(75)));
        let ripple = 1.0 + 0.02 * (f64::from(pixel % 7) - 3.0) / 3.0;
        let white = f64::from(scan.exposure[channel]) / 60.0
            * gain
            * ripple
            * CHANNEL_SENSITIVITY[channel]
            * scan.brightness;
        let y = self.row_position(scan, column, channel, line);
        let reflectance = self
            .config
            .page
            .reflectance(pixel - sensor.first_active_pixel, y);
        black + white * reflectance + noise
    }

    fn shading_entry(&self, column: usize, channel: usize) -> Option<(f64, f64)> {
        let base = column * 12 + channel * 4;
        let bytes = self.shading.get(base..base + 4)?;
        let dark = u16::from_le_bytes([bytes[0], bytes[1]]);
        let coeff = u16::from_le_bytes([bytes[2], bytes[3]]);
        Some((f64::from(dark), f64::from(coeff)))
    }

    fn synthesize_line(&self, scan: &ScanRun, line: u32) -> Vec<u8> {
        let unity = f64::from(self.profile.calibration.shading_unity.max(1));
        let mut out = Vec::with_capacity(scan.line_bytes());
        for column in 0..scan.pixels as usize {
            for &channel in &scan.channels {
                let mut value = self.level(scan, column, channel, line).clamp(0.0, 255.0) * 257.0;
                if scan.shading {
                    if let Some((dark, coeff)) = self.shading_entry(column, channel) {
                        value = ((value - dark).max(0.0) * coeff / unity).min(65535.0);
                    }
                }
                if scan.depth == 16 {
                    out.extend_from_slice(&(value.round() as u16).to_le_bytes());
                } else {
                    out.push((value / 257.0).round().min(255.0) as u8);
                }
            }
        }
        out
    }

    fn read_fifo(&mut self, buf: &mut [u8]) -> usize {
        while self.fifo.len() < buf.len() {
            let Some(scan) = self.scan.as_ref() else {
                break;
            };
            if scan.generated >= scan.captured {
                break;
            }
            let line = self.synthesize_line(scan, scan.generated);
            self.fifo.extend(line);
            if let Some(scan) = self.scan.as_mut() {
                scan.generated += 1;
            }
        }
        let n = buf.len().min(self.fifo.len());
        for (dst, src) in buf.iter_mut().zip(self.fifo.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn clear_fifo(&mut self) {
        self.fifo.clear();
        if let Some(scan) = self.scan.as_mut() {
            scan.generated = scan.captured;
        }
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn ram_mut(&mut self, target: RamTarget) -> &mut Vec<u8> {
        match target {
            RamTarget::Shading => &mut self.shading,
            RamTarget::Gamma => &mut self.gamma,
            RamTarget::Slope => &mut self.slope,
        }
    }

    fn ram(&self, target: RamTarget) -> &[u8] {
        match target {
            RamTarget::Shading => &self.shading,
            RamTarget::Gamma => &self.gamma,
            RamTarget::Slope => &self.slope,
        }
    }

    fn write_ram(&mut self, target: RamTarget, offset: usize, data: &[u8]) {
        let ram = self.ram_mut(target);
        let end = offset + data.len();
        if ram.len() < end {
            ram.resize(end, 0);
        }
        ram[offset..end].copy_from_slice(data);
    }

    fn read_ram(&self, target: RamTarget, offset: usize, buf: &mut [u8]) -> usize {
        let ram = self.ram(target).get(offset..).unwrap_or_default();
        let available = ram.len().min(buf.len());
        buf[..available].copy_from_slice(&ram[..available]);
        buf[available..].fill(0);
        buf.len()
    }

    fn rearm_ram_cursor(&mut self) {
        let Some(field) = self.map.host_start else {
            return;
        };
        let start = self.field(field);
        let target = match (start >> 22) & 0x03 {
            1 => RamTarget::Gamma,
            2 => RamTarget::Slope,
            _ => RamTarget::Shading,
        };
        self.ram_cursor = (target, (start & 0x3f_ffff) as usize * 2);
    }

    // =========================================================================
    // Control-packet framing
    // =========================================================================

    fn control_packet(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize> {
        if request.request != control_packet::REQUEST {
            return Err(ScanError::transport(
                "control",
                format!("unknown request {:#04x}", request.request),
            ));
        }
        let packet: [u8; 4] = data
            .get(..4)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| ScanError::transport("control", "packet shorter than 4 bytes"))?;
        match request.value {
            control_packet::VALUE_WRITE_REGISTERS => {
                if u16::from(packet[0]) == control_packet::BANK_SELECT & 0xff {
                    self.bank = packet[1];
                    return Ok(data.len());
                }
                let base = u16::from(self.bank) << 8;
                self.write_register(base | u16::from(packet[0]), packet[1]);
                if packet[..2] != packet[2..] {
                    self.write_register(base | u16::from(packet[2]), packet[3]);
                }
            }
            control_packet::VALUE_LATCH_ADDRESS => {
                self.latched_addr = (u16::from(self.bank) << 8) | u16::from(packet[0]);
            }
            control_packet::VALUE_READ_DATA if request.is_in() => {
                let value = self.read_register(self.latched_addr);
                data.fill(0);
                data[0] = value;
            }
            control_packet::VALUE_CLEAR_FIFO => {}
            control_packet::VALUE_CLEAR_FIFO_ACK => self.clear_fifo(),
            control_packet::VALUE_DMA_READ => self.dma = Some(TransferDirection::Read),
            control_packet::VALUE_DMA_WRITE => self.dma = Some(TransferDirection::Write),
            other => {
                return Err(ScanError::transport(
                    "control",
                    format!("unknown packet value {other:#04x}"),
                ))
            }
        }
        Ok(data.len())
    }

    // =========================================================================
    // Bulk-header framing
    // =========================================================================

    fn bulk_header_control(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize> {
        if request.request != bulk_header::REQUEST_BUFFER {
            return Err(ScanError::transport(
                "control",
                format!("unknown request {:#04x}", request.request),
            ));
        }
        let high = if request.value & bulk_header::HIGH_REGISTER != 0 {
            0x100
        } else {
            0
        };
        match request.value & 0xff {
            v if v == bulk_header::VALUE_BUFFER => {
                let header = BulkHeader::decode(data)?;
                trace!(?header, "Bulk header");
                self.header = Some((header, 0));
            }
            v if v == bulk_header::VALUE_SET_REGISTER => {
                let [addr, value] = data else {
                    return Err(ScanError::transport("control", "register write is not 2 bytes"));
                };
                let (addr, value) = (*addr, *value);
                self.write_register(high | u16::from(addr), value);
            }
            v if v == bulk_header::VALUE_GET_REGISTER && request.is_in() => {
                let addr = high | (request.index >> 8);
                let value = self.read_register(addr);
                if let [first, second, ..] = data {
                    *first = value;
                    *second = bulk_header::LINK_MARKER;
                }
            }
            other => {
                return Err(ScanError::transport(
                    "control",
                    format!("unknown value {other:#04x}"),
                ))
            }
        }
        Ok(data.len())
    }

    fn space_target(space: Space) -> Option<RamTarget> {
        match space {
            Space::Shading => Some(RamTarget::Shading),
            Space::Gamma => Some(RamTarget::Gamma),
            Space::Slope => Some(RamTarget::Slope),
            Space::ImageFifo | Space::Registers => None,
        }
    }

    // =========================================================================
    // Transport entry points
    // =========================================================================

    fn control_transfer(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize> {
        match self.profile.family {
            AsicFamily::ControlPacket => self.control_packet(request, data),
            AsicFamily::BulkHeader => self.bulk_header_control(request, data),
        }
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.profile.family {
            AsicFamily::ControlPacket => match self.dma {
                Some(TransferDirection::Read) => Ok(self.read_fifo(buf)),
                _ => Err(ScanError::transport("bulk_read", "no DMA read armed")),
            },
            AsicFamily::BulkHeader => {
                let Some((header, done)) = self.header else {
                    return Err(ScanError::transport("bulk_read", "no bulk header"));
                };
                if header.direction != TransferDirection::Read {
                    return Err(ScanError::transport("bulk_read", "header announces a write"));
                }
                let got = match header.space {
                    Space::ImageFifo => self.read_fifo(buf),
                    space => match Self::space_target(space) {
                        Some(target) => {
                            self.read_ram(target, usize::from(header.address) * 2 + done, buf)
                        }
                        None => {
                            return Err(ScanError::transport("bulk_read", "registers are write-only"))
                        }
                    },
                };
                self.header = Some((header, done + got));
                Ok(got)
            }
        }
    }

    fn bulk_write(&mut self, data: &[u8]) -> Result<usize> {
        match self.profile.family {
            AsicFamily::ControlPacket => {
                if self.dma != Some(TransferDirection::Write) {
                    return Err(ScanError::transport("bulk_write", "no DMA write armed"));
                }
                let (target, offset) = self.ram_cursor;
                self.write_ram(target, offset, data);
                self.ram_cursor = (target, offset + data.len());
                Ok(data.len())
            }
            AsicFamily::BulkHeader => {
                let Some((header, done)) = self.header else {
                    return Err(ScanError::transport("bulk_write", "no bulk header"));
                };
                if header.direction != TransferDirection::Write {
                    return Err(ScanError::transport("bulk_write", "header announces a read"));
                }
                match header.space {
                    Space::Registers => {
                        for pair in data.chunks_exact(2) {
                            self.write_register(u16::from(pair[0]), pair[1]);
                        }
                    }
                    Space::ImageFifo => {
                        return Err(ScanError::transport("bulk_write", "image FIFO is read-only"))
                    }
                    space => {
                        if let Some(target) = Self::space_target(space) {
                            self.write_ram(target, usize::from(header.address) * 2 + done, data);
                        }
                    }
                }
                self.header = Some((header, done + data.len()));
                Ok(data.len())
            }
        }
    }
}

/// Simulated scanner for either framing family.
pub struct SimulatedScanner {
    state: Arc<Mutex<DeviceState>>,
    errors: ErrorConfig,
}

impl SimulatedScanner {
    /// Device for `profile` with default behavior.
    #[must_use]
    pub fn new(profile: Arc<ModelProfile>) -> Self {
        Self::with_config(profile, SimulatorConfig::default())
    }

    /// Device for `profile` with `config`.
    #[must_use]
    pub fn with_config(profile: Arc<ModelProfile>, config: SimulatorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::new(profile, config))),
            errors: ErrorConfig::none(),
        }
    }

    /// Inject failures.
    #[must_use]
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Handle for inspecting the device after the transport is handed over.
    #[must_use]
    pub fn probe(&self) -> DeviceProbe {
        DeviceProbe {
            state: Arc::clone(&self.state),
        }
    }

    /// Box as a transport.
    #[must_use]
    pub fn boxed(self) -> BoxedTransport {
        Box::new(self)
    }
}

impl Transport for SimulatedScanner {
    fn control_transfer(&mut self, request: ControlRequest, data: &mut [u8]) -> Result<usize> {
        let operation = if request.is_in() {
            "control_in"
        } else {
            "control_out"
        };
        self.errors.check_operation(operation)?;
        self.state.lock().control_transfer(request, data)
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.errors.check_operation("bulk_read")?;
        self.state.lock().bulk_read(buf)
    }

    fn bulk_write(&mut self, data: &[u8]) -> Result<usize> {
        self.errors.check_operation("bulk_write")?;
        self.state.lock().bulk_write(data)
    }
}

/// Read-mostly view of a [`SimulatedScanner`].
#[derive(Clone)]
pub struct DeviceProbe {
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceProbe {
    /// Raw register content, no side effects.
    #[must_use]
    pub fn register(&self, addr: u16) -> u8 {
        self.state.lock().reg(addr)
    }

    /// Multi-byte register field, no side effects.
    #[must_use]
    pub fn field(&self, field: RegisterField) -> u32 {
        self.state.lock().field(field)
    }

    /// Carriage position in base steps.
    #[must_use]
    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    /// Move the carriage without a motor command.
    pub fn set_position(&self, position: f64) {
        self.state.lock().position = position.max(0.0);
    }

    /// Whether a scan is latched.
    #[must_use]
    pub fn scanning(&self) -> bool {
        self.state.lock().scan.is_some()
    }

    /// Whether power-good is reported.
    #[must_use]
    pub fn powered(&self) -> bool {
        self.state.lock().powered
    }

    /// Copy of a RAM region.
    #[must_use]
    pub fn ram(&self, target: RamTarget) -> Vec<u8> {
        self.state.lock().ram(target).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::ProfileRegistry;

    fn device(model: &str) -> (SimulatedScanner, RegisterMap) {
        let profile = ProfileRegistry::builtin().unwrap().get(model).unwrap();
        let map = RegisterMap::for_family(profile.family);
        (SimulatedScanner::new(profile), map)
    }

    fn bh_write(dev: &mut SimulatedScanner, addr: u16, value: u8) {
        let request = ControlRequest::out(
            bulk_header::REQUEST_BUFFER,
            bulk_header::register_value(bulk_header::VALUE_SET_REGISTER, addr),
            0,
        );
        dev.control_transfer(request, &mut [(addr & 0xff) as u8, value])
            .unwrap();
    }

    fn bh_read(dev: &mut SimulatedScanner, addr: u16) -> [u8; 2] {
        let request = ControlRequest::input(
            bulk_header::REQUEST_BUFFER,
            bulk_header::register_value(bulk_header::VALUE_GET_REGISTER, addr),
            bulk_header::read_index(addr),
        );
        let mut data = [0u8; 2];
        dev.control_transfer(request, &mut data).unwrap();
        data
    }

    fn bh_field(dev: &mut SimulatedScanner, field: RegisterField, value: u32) {
        for (addr, byte) in field.split(value).unwrap() {
            bh_write(dev, addr, byte);
        }
    }

    // =========================================================================
    // Register access
    // =========================================================================

    #[test]
    fn test_bulk_header_register_round_trip() {
        let (mut dev, map) = device("bh1200");
        bh_write(&mut dev, map.gain[0].addr, 0x2a);
        assert_eq!(bh_read(&mut dev, map.gain[0].addr), [0x2a, bulk_header::LINK_MARKER]);
        bh_write(&mut dev, map.fast_steps.addr, 0x12);
        assert_eq!(dev.probe().register(0x101), 0x12);
    }

    #[test]
    fn test_control_packet_banked_write_and_read() {
        let (mut dev, _) = device("cp1200");
        let out = |value, index| ControlRequest::out(control_packet::REQUEST, value, index);
        dev.control_transfer(out(0xb0, 0), &mut [0x5f, 1, 0x5f, 1]).unwrap();
        dev.control_transfer(out(0xb0, 0), &mut [0x60, 7, 0x61, 9]).unwrap();
        assert_eq!(dev.probe().register(0x160), 7);
        assert_eq!(dev.probe().register(0x161), 9);

        dev.control_transfer(out(0x04, 0x61), &mut [0x61; 4]).unwrap();
        let mut reply = [0u8; 4];
        dev.control_transfer(
            ControlRequest::input(control_packet::REQUEST, control_packet::VALUE_READ_DATA, 0),
            &mut reply,
        )
        .unwrap();
        assert_eq!(reply[0], 9);
    }

    #[test]
    fn test_unknown_request_rejected() {
        let (mut dev, _) = device("bh1200");
        let request = ControlRequest::out(0x09, 0, 0);
        assert!(dev.control_transfer(request, &mut [0, 0]).is_err());
    }

    #[test]
    fn test_status_reports_power_and_home() {
        let (mut dev, map) = device("bh1200");
        let StatusAccess::Direct(addr) = map.status else {
            panic!("bulk-header status is direct");
        };
        let status = StatusFlags::from_bits_retain(bh_read(&mut dev, addr)[0]);
        assert!(status.contains(StatusFlags::POWER | StatusFlags::HOME_SENSOR));
        assert!(status.contains(StatusFlags::BUFFER_EMPTY));
    }

    #[test]
    fn test_cold_device_powers_up_on_first_write() {
        let profile = ProfileRegistry::builtin().unwrap().get("bh1200").unwrap();
        let config = SimulatorConfig {
            powered: false,
            ..SimulatorConfig::default()
        };
        let mut dev = SimulatedScanner::with_config(profile, config);
        assert!(!dev.probe().powered());
        bh_write(&mut dev, 0x06, 0x18);
        assert!(dev.probe().powered());
    }

    // =========================================================================
    // Image data
    // =========================================================================

    #[test]
    fn test_scan_produces_lines_on_poll() {
        let (mut dev, map) = device("bh1200");
        bh_field(&mut dev, map.dpi, 1200);
        bh_field(&mut dev, map.start_pixel, 140);
        bh_field(&mut dev, map.pixel_count, 10);
        bh_field(&mut dev, map.line_count, 4);
        bh_write(&mut dev, map.depth.addr, 8);
        bh_write(&mut dev, map.channels.addr, 1 | (1 << 4));
        bh_field(&mut dev, map.exposure[1], 7000);
        bh_write(&mut dev, map.lamp.addr, lamp_bits::LAMP_ON);
        bh_write(&mut dev, map.scan_control.addr, scan_bits::SCAN_ENABLE);
        assert!(dev.probe().scanning());

        let words = map
            .valid_words
            .addresses()
            .map(|a| bh_read(&mut dev, a)[0])
            .collect::<Vec<_>>();
        assert_eq!(map.valid_words.assemble(|a| words[usize::from(a - map.valid_words.addr)]), 20);

        let header = BulkHeader::for_window(
            TransferDirection::Read,
            scan_core::AddressWindow::ImageFifo,
            40,
        )
        .unwrap();
        let request = ControlRequest::out(bulk_header::REQUEST_BUFFER, bulk_header::VALUE_BUFFER, 0);
        dev.control_transfer(request, &mut header.encode()).unwrap();
        let mut buf = [0u8; 40];
        assert_eq!(dev.bulk_read(&mut buf).unwrap(), 40);
        // white reference under a lit lamp
        assert!(buf.iter().all(|&v| v > 100), "{buf:?}");
        // nothing more captured
        let mut more = [0u8; 10];
        assert_eq!(dev.bulk_read(&mut more).unwrap(), 0);
    }

    #[test]
    fn test_lamp_off_reads_black() {
        let profile = ProfileRegistry::builtin().unwrap().get("bh1200").unwrap();
        let state = DeviceState::new(profile, SimulatorConfig::default());
        let scan = ScanRun {
            dpi: 1200,
            start_pixel: 140,
            pixels: 4,
            channels: vec![0, 1, 2],
            depth: 8,
            line_count: 1,
            exposure: [7000; 3],
            gain: [10; 3],
            offset: [100; 3],
            lamp: false,
            brightness: 1.0,
            shading: false,
            reverse: false,
            moving: false,
            start_position: 0.0,
            line_distance: 0,
            pixel_distance: 0,
            captured: 1,
            generated: 0,
        };
        let line = state.synthesize_line(&scan, 0);
        assert_eq!(line.len(), 12);
        assert!(line.iter().all(|&v| (9..=11).contains(&v)), "{line:?}");
    }

    #[test]
    fn test_page_model_regions() {
        let page = PageModel::default();
        assert_eq!(page.reflectance(0, 10.0), 1.0);
        assert_eq!(page.reflectance(0, 900.0), page.strip_reflectance);
        let a = page.reflectance(0, 1200.0);
        let b = page.reflectance(page.cell, 1200.0);
        assert_ne!(a, b);
    }

    // =========================================================================
    // Motion
    // =========================================================================

    #[test]
    fn test_feed_completes_after_polls() {
        let (mut dev, map) = device("bh1200");
        let StatusAccess::Direct(status) = map.status else {
            panic!("bulk-header status is direct");
        };
        bh_field(&mut dev, map.feed_steps, 400);
        bh_write(
            &mut dev,
            map.motor_control.addr,
            motor_bits::MOTOR_ENABLE | motor_bits::FEED_ONLY,
        );
        bh_write(&mut dev, map.start_motor.addr, 1);
        let mut finished = false;
        for _ in 0..5 {
            let flags = StatusFlags::from_bits_retain(bh_read(&mut dev, status)[0]);
            if flags.contains(StatusFlags::FEED_FINISHED) {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(dev.probe().position(), 400.0);
    }

    // =========================================================================
    // Memory and errors
    // =========================================================================

    #[test]
    fn test_control_packet_ram_write_follows_host_start() {
        let (mut dev, _) = device("cp1200");
        let out = |value| ControlRequest::out(control_packet::REQUEST, value, 0);
        let start = 0x10 | (u32::from(control_packet::access_bits(RamTarget::Gamma)) << 16);
        let bytes = start.to_le_bytes();
        dev.control_transfer(out(0xb0), &mut [0xa0, bytes[0], 0xa1, bytes[1]]).unwrap();
        dev.control_transfer(out(0xb0), &mut [0xa2, bytes[2], 0xa2, bytes[2]]).unwrap();
        dev.control_transfer(out(0x02), &mut 4u32.to_le_bytes()).unwrap();
        dev.bulk_write(&[1, 2, 3, 4]).unwrap();
        let gamma = dev.probe().ram(RamTarget::Gamma);
        assert_eq!(&gamma[0x20..0x24], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_injected_error_skips_device() {
        let (dev, map) = device("bh1200");
        let mut dev = dev.with_errors(ErrorConfig::scenario(
            crate::ErrorScenario::Timeout {
                operation: "control_out",
            },
        ));
        let request = ControlRequest::out(
            bulk_header::REQUEST_BUFFER,
            bulk_header::VALUE_SET_REGISTER,
            0,
        );
        let err = dev
            .control_transfer(request, &mut [map.lamp.addr as u8, 0])
            .unwrap_err();
        assert!(matches!(err, ScanError::Timeout { .. }));
        assert_eq!(dev.probe().register(map.lamp.addr), 0);
    }
}
