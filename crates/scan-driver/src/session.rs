//! Device session: the public face of the engine.
//!
//! A [`DeviceSession`] owns the command channel, the register shadow, the
//! acquisition pipeline and the cached calibration for one open device.
//! Calibration and scanning are sequential phases on the same session, so
//! the register shadow is never shared between threads.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use scan_core::{BoxedTransport, ProfileRegistry, ScanRequest};
//! # use scan_driver::DeviceSession;
//! # fn demo(transport: BoxedTransport) -> scan_core::Result<()> {
//! let profile = ProfileRegistry::builtin()?.get("bh1200")?;
//! let mut session = DeviceSession::open(profile, transport);
//! session.init()?;
//! let setup = session.prepare(&ScanRequest::builder().resolution(300).area(100, 100).build())?;
//! session.begin_scan(&setup)?;
//! let lines = session.read_lines(100)?;
//! session.end_scan()?;
//! # Ok(()) }
//! ```

use std::sync::Arc;
use std::time::Duration;

use scan_core::registers::{clear_bits, lamp_bits, motor_bits, scan_bits};
use scan_core::{
    BoxedTransport, ModelProfile, Result, ScanError, ScanFlags, ScanRequest, ScanSetup,
    StatusFlags,
};
use tracing::{debug, info, instrument, warn};

use crate::calibration::{
    AnalogParams, CalibrationEngine, CalibrationReport, CalibrationScanner, CalibrationState,
    RawCapture,
};
use crate::channel::{open_channel, SharedChannel};
use crate::gamma::GammaTables;
use crate::motion::MotionPlan;
use crate::pipeline::{AcquisitionPipeline, PipelineState, ScanOptions};
use crate::poll::{CancelToken, Poller};
use crate::reconstruct::{LineReconstructor, ScanLine};
use crate::register_set::RegisterSet;
use crate::status;

/// One open connection to a scanner.
pub struct DeviceSession {
    profile: Arc<ModelProfile>,
    channel: SharedChannel,
    regs: RegisterSet,
    pipeline: AcquisitionPipeline,
    calibration: Option<CalibrationState>,
    gamma: Option<[f64; 3]>,
    reconstructor: Option<LineReconstructor>,
    pending_error: Option<ScanError>,
}

impl DeviceSession {
    /// Wrap `transport` with the channel for the profile's framing family.
    #[must_use]
    pub fn open(profile: Arc<ModelProfile>, transport: BoxedTransport) -> Self {
        let channel = open_channel(profile.family, transport, &profile.transfer);
        let regs = RegisterSet::new(scan_core::RegisterMap::for_family(profile.family));
        let pipeline = AcquisitionPipeline::new(Arc::clone(&channel), Arc::clone(&profile));
        info!(model = %profile.model, family = %profile.family, "Session opened");
        Self {
            profile,
            channel,
            regs,
            pipeline,
            calibration: None,
            gamma: None,
            reconstructor: None,
            pending_error: None,
        }
    }

    /// Model profile.
    #[must_use]
    pub fn profile(&self) -> &Arc<ModelProfile> {
        &self.profile
    }

    /// Pipeline state.
    #[must_use]
    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline.state()
    }

    /// Token that cancels the running scan or move.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.pipeline.cancel_token()
    }

    /// Cached calibration, if any.
    #[must_use]
    pub fn calibration(&self) -> Option<&CalibrationState> {
        self.calibration.as_ref()
    }

    /// Register shadow.
    #[must_use]
    pub fn registers(&self) -> &RegisterSet {
        &self.regs
    }

    /// Main status byte.
    pub fn status(&self) -> Result<StatusFlags> {
        status::read_status(self.channel.as_ref(), self.regs.map())
    }

    fn require_idle(&self) -> Result<()> {
        if self.pipeline.state() != PipelineState::Idle || self.reconstructor.is_some() {
            return Err(ScanError::InvalidState {
                expected: "Idle",
                actual: self.pipeline.state().to_string(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Read the power state and boot accordingly.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<()> {
        let status = self.status()?;
        let cold = !status.contains(StatusFlags::POWER);
        debug!(?status, cold, "Device status at init");
        self.boot(cold)
    }

    /// Bring the register file to a known state.
    ///
    /// A cold boot rewrites every register, resets gamma RAM to identity and
    /// drops cached calibration. A warm boot only writes what changed.
    #[instrument(skip(self))]
    pub fn boot(&mut self, cold: bool) -> Result<()> {
        self.require_idle()?;
        self.regs.load_defaults(&self.profile.register_defaults);
        AnalogParams::from_sensor(&self.profile.sensor).stage(&mut self.regs)?;
        let map = self.regs.map().clone();
        self.regs.set_bits(map.scan_control, scan_bits::SCAN_ENABLE, false);
        self.regs.set_bits(map.scan_control, scan_bits::GAMMA_ENABLE, false);
        self.regs.set_bits(map.motor_control, motor_bits::MOTOR_ENABLE, false);
        self.regs.set_bits(map.lamp, lamp_bits::LAMP_ON, true);
        if cold {
            self.regs.mark_all_dirty();
        }
        let written = self.regs.flush(self.channel.as_ref())?;
        if cold {
            GammaTables::identity(8)?.upload(self.channel.as_ref())?;
            self.calibration = None;
        }
        info!(cold, registers = written, "Device booted");
        Ok(())
    }

    /// Switch the lamp.
    pub fn set_lamp(&mut self, on: bool) -> Result<()> {
        self.require_idle()?;
        let map = self.regs.map().clone();
        self.regs.set_bits(map.lamp, lamp_bits::LAMP_ON, on);
        self.regs.flush(self.channel.as_ref())?;
        debug!(on, "Lamp switched");
        Ok(())
    }

    /// Host-side gamma exponents, R, G, B. Validated immediately.
    pub fn set_gamma(&mut self, exponents: [f64; 3]) -> Result<()> {
        GammaTables::from_exponents(8, exponents)?;
        self.gamma = Some(exponents);
        Ok(())
    }

    /// Forget cached calibration.
    pub fn invalidate_calibration(&mut self) {
        if self.calibration.take().is_some() {
            debug!("Calibration invalidated");
        }
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// Run every calibration procedure and cache the result.
    #[instrument(skip(self))]
    pub fn run_calibration(&mut self) -> Result<CalibrationReport> {
        self.require_idle()?;
        let profile = Arc::clone(&self.profile);
        let engine = CalibrationEngine::new(&profile.sensor, &profile.calibration)
            .warmup_interval(Duration::from_millis(profile.timing.warmup_interval_ms));
        let state = engine.run(&mut SessionScanner { session: self })?;
        let report = state.report;
        state.analog.stage(&mut self.regs)?;
        self.calibration = Some(state);
        Ok(report)
    }

    fn fresh_calibration(&self) -> Option<&CalibrationState> {
        self.calibration
            .as_ref()
            .filter(|c| c.is_fresh(self.profile.calibration.cache_expiry_minutes))
    }

    /// One stationary capture for calibration.
    fn capture(
        &mut self,
        params: &AnalogParams,
        lamp: bool,
        lines: u32,
        depth: u8,
    ) -> Result<RawCapture> {
        let flags = if lamp {
            ScanFlags::empty()
        } else {
            ScanFlags::LAMP_OFF
        };
        let setup = ScanSetup::calibration(&self.profile, depth, lines, flags);
        params.stage(&mut self.regs)?;
        self.pipeline
            .begin(&setup, &mut self.regs, ScanOptions::default())?;
        let raw = self.pipeline.read_raw_lines(lines as usize);
        let ended = self.pipeline.end(&mut self.regs);
        let raw = raw?;
        ended?;
        if raw.len() < lines as usize {
            return Err(ScanError::InvalidState {
                expected: "complete calibration capture",
                actual: format!("{} of {lines} lines", raw.len()),
            });
        }
        RawCapture::from_raw(&raw, setup.pixels as usize, 3, setup.raw_depth)
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Validate `request` and derive its geometry.
    pub fn prepare(&self, request: &ScanRequest) -> Result<ScanSetup> {
        ScanSetup::resolve(request, &self.profile)
    }

    /// Program and start `setup`.
    ///
    /// Calibrates first unless shading is disabled or a fresh calibration is
    /// cached. Shading-disabled scans use cached analog settings when
    /// available and the profile defaults otherwise.
    #[instrument(skip_all, fields(resolution = setup.resolution, lines = setup.lines))]
    pub fn begin_scan(&mut self, setup: &ScanSetup) -> Result<()> {
        self.require_idle()?;
        if setup.feed_only() {
            return Err(ScanError::invalid("flags", "feed-only setups move with feed()"));
        }
        let shading = !setup.flags.contains(ScanFlags::DISABLE_SHADING);
        if shading && self.fresh_calibration().is_none() {
            self.run_calibration()?;
        }
        let analog = self
            .fresh_calibration()
            .map_or_else(|| AnalogParams::from_sensor(&self.profile.sensor), |c| c.analog);

        let plan = MotionPlan::for_scan(
            &self.profile.motor,
            &self.profile.sensor,
            setup,
            analog.max_exposure(),
        );
        plan.apply(&mut self.regs)?;
        plan.upload(self.channel.as_ref())?;
        analog.stage(&mut self.regs)?;
        if shading {
            if let Some(state) = self.fresh_calibration() {
                state
                    .shading
                    .for_setup(setup, self.profile.sensor.optical_dpi)
                    .upload(self.channel.as_ref())?;
            }
        }

        let options = ScanOptions {
            motor: !setup.flags.contains(ScanFlags::SINGLE_LINE),
            shading,
            fast_feed: plan.feed_steps > 0,
        };
        self.pipeline.begin(setup, &mut self.regs, options)?;

        let gamma = match self.gamma {
            Some(exponents) if setup.depth != 1 => {
                Some(Arc::new(GammaTables::from_exponents(setup.raw_depth, exponents)?))
            }
            _ => None,
        };
        self.reconstructor = Some(LineReconstructor::new(setup.clone(), gamma));
        self.pending_error = None;
        Ok(())
    }

    /// Up to `count` more lines of the running scan.
    ///
    /// Fewer lines come back at the end of the scan or after a cancel. A
    /// transport error or timeout stops the device; lines produced before
    /// it are returned first and the error is reported by the next call.
    pub fn read_lines(&mut self, count: usize) -> Result<Vec<ScanLine>> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        let Some(rec) = self.reconstructor.as_mut() else {
            return Err(ScanError::InvalidState {
                expected: "Scanning",
                actual: self.pipeline.state().to_string(),
            });
        };
        let pipeline = &self.pipeline;
        let mut lines = Vec::with_capacity(count.min(rec.remaining() as usize));
        let mut failure = None;
        while lines.len() < count && rec.remaining() > 0 {
            let needed = rec.last_raw_for(rec.next_index());
            match pipeline.wait_line(needed) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            match rec.reconstruct(|index| pipeline.raw_line(index)) {
                Ok(line) => {
                    pipeline.release_until(line.index + 1);
                    lines.push(line);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!(error = %e, delivered = lines.len(), "Scan failed, stopping device");
            self.pipeline.abort(&mut self.regs);
            if lines.is_empty() {
                return Err(e);
            }
            self.pending_error = Some(e);
        }
        Ok(lines)
    }

    /// Stop the running scan and return to `Idle`.
    #[instrument(skip(self))]
    ///
    /// A failure not yet reported by [`read_lines`](Self::read_lines) is
    /// returned here once the device is stopped.
    pub fn end_scan(&mut self) -> Result<()> {
        if let Some(rec) = self.reconstructor.take() {
            debug!(delivered = rec.next_index(), "Ending scan");
        }
        let pending = self.pending_error.take();
        self.pipeline.end(&mut self.regs)?;
        pending.map_or(Ok(()), Err)
    }

    /// Prepare, run and end a whole scan.
    ///
    /// Fails if any part of the scan failed, even when some lines were
    /// already delivered.
    pub fn scan(&mut self, request: &ScanRequest) -> Result<Vec<ScanLine>> {
        let setup = self.prepare(request)?;
        self.begin_scan(&setup)?;
        let lines = self.read_lines(setup.lines as usize);
        let ended = self.end_scan();
        let lines = lines?;
        ended?;
        Ok(lines)
    }

    // =========================================================================
    // Motion
    // =========================================================================

    fn start_move(&mut self, plan: &MotionPlan, reverse: bool, home: bool) -> Result<()> {
        plan.apply(&mut self.regs)?;
        plan.upload(self.channel.as_ref())?;
        let map = self.regs.map().clone();
        self.regs.set_bits(map.scan_control, scan_bits::SCAN_ENABLE, false);
        self.regs.set_bits(
            map.motor_control,
            motor_bits::MOTOR_ENABLE | motor_bits::FEED_ONLY,
            true,
        );
        self.regs.set_bits(map.motor_control, motor_bits::FAST_FEED, false);
        self.regs.set_bits(map.motor_control, motor_bits::REVERSE, reverse);
        self.regs.set_bits(map.motor_control, motor_bits::HOME_ON_END, home);
        self.regs.flush(self.channel.as_ref())?;
        self.channel
            .write_register(map.clear_counters.addr, clear_bits::MOTOR_COUNT)?;
        self.channel.write_register(map.start_motor.addr, 1)
    }

    fn stop_motor(&mut self) -> Result<()> {
        let map = self.regs.map().clone();
        self.regs.set_bits(
            map.motor_control,
            motor_bits::MOTOR_ENABLE | motor_bits::FEED_ONLY | motor_bits::HOME_ON_END,
            false,
        );
        self.regs.flush(self.channel.as_ref())?;
        Ok(())
    }

    fn wait_status(&self, poller: &Poller, flag: StatusFlags, cancel: &CancelToken) -> Result<bool> {
        let map = self.regs.map().clone();
        let found = poller.until(cancel, || {
            let status = status::read_status(self.channel.as_ref(), &map)?;
            Ok(status.contains(flag).then_some(()))
        })?;
        Ok(found.is_some())
    }

    /// Move the medium forward by `steps` micro-steps without capturing.
    #[instrument(skip(self))]
    pub fn feed(&mut self, steps: u32) -> Result<()> {
        self.require_idle()?;
        if steps == 0 {
            return Ok(());
        }
        let cancel = self.pipeline.cancel_token();
        cancel.reset();
        let plan = MotionPlan::for_move(&self.profile.motor, &self.profile.sensor, steps);
        self.start_move(&plan, false, false)?;
        let waited = self.wait_status(
            &Poller::feed(&self.profile.timing),
            StatusFlags::FEED_FINISHED,
            &cancel,
        );
        let stopped = self.stop_motor();
        let finished = waited?;
        stopped?;
        info!(steps, finished, "Feed done");
        Ok(())
    }

    /// Return the carriage to the home sensor at low speed.
    ///
    /// With `wait` the call blocks until the sensor trips; otherwise the
    /// motor is left running and stops on the sensor by itself.
    #[instrument(skip(self))]
    pub fn slow_back_home(&mut self, wait: bool) -> Result<()> {
        self.require_idle()?;
        if self.profile.sheetfed {
            debug!("Sheet-fed device has no home position");
            return Ok(());
        }
        if self.status()?.contains(StatusFlags::HOME_SENSOR) {
            debug!("Already at home");
            return Ok(());
        }
        let cancel = self.pipeline.cancel_token();
        cancel.reset();
        let plan = MotionPlan::for_home(&self.profile.motor);
        self.start_move(&plan, true, true)?;
        if !wait {
            return Ok(());
        }
        let waited = self.wait_status(
            &Poller::home(&self.profile.timing),
            StatusFlags::HOME_SENSOR,
            &cancel,
        );
        let stopped = self.stop_motor();
        let reached = waited?;
        stopped?;
        info!(reached, "Back home");
        Ok(())
    }

    /// Scan short passes at the lowest resolution looking for a line that
    /// is almost entirely black (or white). Returns whether one was found.
    #[instrument(skip(self))]
    pub fn search_strip(&mut self, forward: bool, black: bool) -> Result<bool> {
        self.require_idle()?;
        let sensor = &self.profile.sensor;
        let targets = self.profile.calibration.clone();
        let resolution = sensor.lowest_resolution();
        let pixels = sensor.pixels_at(resolution);
        let mut flags = ScanFlags::DISABLE_SHADING | ScanFlags::DISABLE_GAMMA;
        if !forward {
            flags |= ScanFlags::REVERSE;
        }
        let request = ScanRequest::builder()
            .resolution(resolution)
            .area(pixels, targets.strip_lines.max(1))
            .flags(flags)
            .build();

        for pass in 0..targets.strip_passes {
            let lines = self.scan(&request)?;
            let found = lines.iter().any(|line| {
                let hits = line
                    .data
                    .iter()
                    .filter(|&&v| {
                        if black {
                            v < targets.strip_black_threshold
                        } else {
                            v > targets.strip_white_threshold
                        }
                    })
                    .count();
                hits as f64 / line.data.len().max(1) as f64 >= targets.strip_ratio
            });
            if found {
                info!(pass, black, forward, "Strip found");
                return Ok(true);
            }
            debug!(pass, "Strip not in pass");
        }
        info!(passes = targets.strip_passes, black, "Strip not found");
        Ok(false)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.pipeline.state() != PipelineState::Idle {
            self.pipeline.abort(&mut self.regs);
        }
    }
}

/// Calibration captures through the session's pipeline.
struct SessionScanner<'a> {
    session: &'a mut DeviceSession,
}

impl CalibrationScanner for SessionScanner<'_> {
    fn capture(
        &mut self,
        params: &AnalogParams,
        lamp: bool,
        lines: u32,
        depth: u8,
    ) -> Result<RawCapture> {
        self.session.capture(params, lamp, lines, depth)
    }
}
