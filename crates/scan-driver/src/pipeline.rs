//! Acquisition pipeline: scan start/stop state machine and the reader task.
//!
//! `Idle → Configured → Scanning → Draining → Idle`
//!
//! [`AcquisitionPipeline::begin`] programs the scan registers and starts a
//! background reader that moves raw lines from the device into a
//! [`TransferBuffer`]. The consumer waits for lines with
//! [`wait_line`](AcquisitionPipeline::wait_line) and releases them once
//! reconstructed. [`end`](AcquisitionPipeline::end) cancels the reader,
//! clears scan-enable and runs the stop action.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use scan_core::registers::{lamp_bits, motor_bits, scan_bits};
use scan_core::{
    AddressWindow, ModelProfile, MotionFlags, RegisterMap, Result, ScanError, ScanFlags,
    ScanSetup,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::buffer::TransferBuffer;
use crate::channel::SharedChannel;
use crate::poll::{CancelToken, Poller};
use crate::register_set::RegisterSet;
use crate::status;

/// Pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No scan programmed.
    Idle,
    /// Registers written, scan not started.
    Configured,
    /// Reader running.
    Scanning,
    /// Stopping; remaining data is discarded.
    Draining,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "Idle",
            Self::Configured => "Configured",
            Self::Scanning => "Scanning",
            Self::Draining => "Draining",
        };
        f.write_str(label)
    }
}

/// Per-scan switches that are not part of the geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOptions {
    /// Start the motor with the scan.
    pub motor: bool,
    /// Let the device apply its shading RAM.
    pub shading: bool,
    /// A fast-table move precedes the first line.
    pub fast_feed: bool,
}

/// Stage the geometry registers of `setup`.
pub fn stage_geometry(
    regs: &mut RegisterSet,
    setup: &ScanSetup,
    profile: &ModelProfile,
    options: ScanOptions,
) -> Result<()> {
    let map: RegisterMap = regs.map().clone();
    regs.set_field(map.dpi, u32::from(setup.resolution))?;
    regs.set_field(map.start_pixel, setup.start_pixel)?;
    regs.set_field(map.pixel_count, setup.pixels)?;
    regs.set_field(map.line_count, setup.raw_lines)?;
    regs.set_field(map.depth, u32::from(setup.raw_depth))?;
    let channels = if setup.channels == 3 {
        3
    } else {
        1 | ((setup.color_filter.index() as u32) << 4)
    };
    regs.set_field(map.channels, channels)?;
    regs.set_field(map.line_period, u32::from(profile.sensor.line_period))?;

    regs.set_bits(map.scan_control, scan_bits::SCAN_ENABLE, false);
    regs.set_bits(map.scan_control, scan_bits::SHADING_ENABLE, options.shading);
    regs.set_bits(map.scan_control, scan_bits::GAMMA_ENABLE, false);

    regs.set_bits(map.motor_control, motor_bits::MOTOR_ENABLE, options.motor);
    regs.set_bits(map.motor_control, motor_bits::FAST_FEED, options.fast_feed);
    regs.set_bits(
        map.motor_control,
        motor_bits::REVERSE,
        setup.flags.contains(ScanFlags::REVERSE),
    );
    regs.set_bits(map.motor_control, motor_bits::FEED_ONLY, setup.feed_only());
    regs.set_bits(map.motor_control, motor_bits::HOME_ON_END, false);

    regs.set_bits(
        map.lamp,
        lamp_bits::LAMP_ON,
        !setup.flags.contains(ScanFlags::LAMP_OFF),
    );
    Ok(())
}

/// Clear scan-enable and, unless sheet-fed, wait for data path and motor to
/// go quiet.
pub fn stop_device(
    channel: &SharedChannel,
    regs: &mut RegisterSet,
    profile: &ModelProfile,
) -> Result<()> {
    let map = regs.map().clone();
    regs.set_bits(map.scan_control, scan_bits::SCAN_ENABLE, false);
    regs.flush(channel.as_ref())?;
    if !profile.sheetfed {
        Poller::stop(&profile.timing).until(&CancelToken::new(), || {
            let motion = status::read_motion(channel.as_ref(), &map)?;
            Ok((!motion.intersects(MotionFlags::DATA_ENABLED | MotionFlags::MOTOR_MOVING))
                .then_some(()))
        })?;
    }
    channel.clear_fifo()
}

#[derive(Debug, Default)]
struct ReaderShared {
    error: Mutex<Option<ScanError>>,
    done: AtomicBool,
}

struct ReaderContext {
    channel: SharedChannel,
    map: RegisterMap,
    profile: Arc<ModelProfile>,
    buffer: Arc<TransferBuffer>,
    shared: Arc<ReaderShared>,
    cancel: CancelToken,
    raw_lines: u64,
    block_lines: usize,
}

fn read_loop(ctx: &ReaderContext) -> Result<()> {
    let line_bytes = ctx.buffer.line_bytes();
    let mut scratch = vec![0u8; ctx.block_lines * line_bytes];
    let data_poll = Poller::data(&ctx.profile.timing);
    let interval = Duration::from_micros(ctx.profile.timing.consumer_wait_us.max(1));
    let mut done = 0u64;

    while done < ctx.raw_lines {
        if ctx.cancel.is_cancelled() {
            debug!(done, "Reader cancelled");
            return Ok(());
        }
        let lines = (ctx.raw_lines - done).min(ctx.block_lines as u64) as usize;

        if !ctx.buffer.can_write(lines) {
            trace!(pending = ctx.buffer.pending(), "Reader paused for consumer");
            while !ctx.buffer.can_write(lines) {
                if ctx.cancel.wait(interval) {
                    return Ok(());
                }
            }
        }

        let bytes = lines * line_bytes;
        let ready = data_poll.until(&ctx.cancel, || {
            let words = status::valid_words(ctx.channel.as_ref(), &ctx.map)?;
            Ok((words as usize * 2 >= bytes).then_some(()))
        })?;
        if ready.is_none() {
            return Ok(());
        }

        ctx.channel
            .bulk_read(AddressWindow::ImageFifo, &mut scratch[..bytes])?;
        ctx.buffer.write_lines(&scratch[..bytes])?;
        done += lines as u64;
        trace!(done, total = ctx.raw_lines, "Reader block stored");
    }
    debug!(lines = done, "Reader finished");
    Ok(())
}

fn run_reader(ctx: ReaderContext) {
    if let Err(e) = read_loop(&ctx) {
        warn!(error = %e, "Reader stopped on error");
        *ctx.shared.error.lock() = Some(e);
    }
    ctx.shared.done.store(true, Ordering::SeqCst);
}

/// Scan state machine plus the bounded reader/consumer buffer.
pub struct AcquisitionPipeline {
    channel: SharedChannel,
    profile: Arc<ModelProfile>,
    state: PipelineState,
    cancel: CancelToken,
    buffer: Option<Arc<TransferBuffer>>,
    shared: Arc<ReaderShared>,
    reader: Option<JoinHandle<()>>,
    raw_lines: u64,
}

impl AcquisitionPipeline {
    /// Idle pipeline on `channel`.
    #[must_use]
    pub fn new(channel: SharedChannel, profile: Arc<ModelProfile>) -> Self {
        Self {
            channel,
            profile,
            state: PipelineState::Idle,
            cancel: CancelToken::new(),
            buffer: None,
            shared: Arc::new(ReaderShared::default()),
            reader: None,
            raw_lines: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Token that cancels the running scan.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Raw lines the running scan will deliver.
    #[must_use]
    pub fn raw_lines(&self) -> u64 {
        self.raw_lines
    }

    /// Program `setup` and start the reader.
    #[instrument(skip_all, fields(raw_lines = setup.raw_lines, resolution = setup.resolution))]
    pub fn begin(
        &mut self,
        setup: &ScanSetup,
        regs: &mut RegisterSet,
        options: ScanOptions,
    ) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(ScanError::InvalidState {
                expected: "Idle",
                actual: self.state.to_string(),
            });
        }
        if setup.raw_bytes_per_line == 0 || setup.raw_lines == 0 {
            return Err(ScanError::invalid("scan_setup", "nothing to capture"));
        }
        self.cancel.reset();

        stage_geometry(regs, setup, &self.profile, options)?;
        regs.flush(self.channel.as_ref())?;
        self.state = PipelineState::Configured;

        if let Err(e) = self.start(setup, regs, options) {
            warn!(error = %e, "Scan start failed, stopping device");
            if let Err(stop) = stop_device(&self.channel, regs, &self.profile) {
                debug!(error = %stop, "Best-effort stop failed");
            }
            self.state = PipelineState::Idle;
            return Err(e);
        }
        info!(raw_lines = setup.raw_lines, "Scan started");
        Ok(())
    }

    fn start(&mut self, setup: &ScanSetup, regs: &mut RegisterSet, options: ScanOptions) -> Result<()> {
        use scan_core::registers::clear_bits;

        let map = regs.map().clone();
        self.channel.clear_fifo()?;
        self.channel.write_register(
            map.clear_counters.addr,
            clear_bits::LINE_COUNT | clear_bits::MOTOR_COUNT,
        )?;
        regs.set_bits(map.scan_control, scan_bits::SCAN_ENABLE, true);
        regs.flush(self.channel.as_ref())?;
        if options.motor {
            self.channel.write_register(map.start_motor.addr, 1)?;
        }

        let line_bytes = setup.raw_bytes_per_line;
        let block_lines = (self.profile.transfer.max_chunk / line_bytes).max(1);
        let min_lines = setup.lead_lines as usize + 2 * block_lines + 1;
        let buffer = Arc::new(TransferBuffer::with_budget(
            line_bytes,
            self.profile.transfer.buffer_bytes,
            min_lines,
        )?);

        self.shared = Arc::new(ReaderShared::default());
        self.raw_lines = u64::from(setup.raw_lines);
        let ctx = ReaderContext {
            channel: Arc::clone(&self.channel),
            map,
            profile: Arc::clone(&self.profile),
            buffer: Arc::clone(&buffer),
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
            raw_lines: self.raw_lines,
            block_lines,
        };
        let handle = thread::Builder::new()
            .name("scan-reader".into())
            .spawn(move || run_reader(ctx))
            .map_err(|e| ScanError::transport("spawn_reader", e.to_string()))?;

        self.buffer = Some(buffer);
        self.reader = Some(handle);
        self.state = PipelineState::Scanning;
        Ok(())
    }

    /// Block until raw line `index` is stored.
    ///
    /// Returns `Ok(false)` when the scan ended before the line arrived or was
    /// cancelled, and the reader's error if it failed. Once cancelled, lines
    /// already buffered are not handed out.
    pub fn wait_line(&self, index: u64) -> Result<bool> {
        let buffer = match (&self.buffer, self.state) {
            (Some(b), PipelineState::Scanning) => b,
            _ => return Ok(false),
        };
        let interval = Duration::from_micros(self.profile.timing.consumer_wait_us.max(1));
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            if buffer.written() > index {
                return Ok(true);
            }
            if let Some(e) = self.shared.error.lock().take() {
                return Err(e);
            }
            if self.shared.done.load(Ordering::SeqCst) {
                return Ok(buffer.written() > index);
            }
            if self.cancel.wait(interval) {
                return Ok(false);
            }
        }
    }

    /// Copy of stored raw line `index`.
    pub fn raw_line(&self, index: u64) -> Result<Vec<u8>> {
        match &self.buffer {
            Some(buffer) => buffer.line(index),
            None => Err(ScanError::InvalidState {
                expected: "Scanning",
                actual: self.state.to_string(),
            }),
        }
    }

    /// Release raw lines below `index`.
    pub fn release_until(&self, index: u64) {
        if let Some(buffer) = &self.buffer {
            buffer.release_until(index);
        }
    }

    /// Read the next `count` raw lines in order, releasing them as they go.
    /// Fewer lines come back if the scan is cancelled.
    pub fn read_raw_lines(&self, count: usize) -> Result<Vec<Vec<u8>>> {
        let start = self.buffer.as_ref().map_or(0, |b| b.consumed());
        let mut lines = Vec::with_capacity(count);
        for index in start..start + count as u64 {
            if !self.wait_line(index)? {
                break;
            }
            lines.push(self.raw_line(index)?);
            self.release_until(index + 1);
        }
        Ok(lines)
    }

    /// Stop the running scan.
    ///
    /// Remaining buffered data is discarded. A stop-action timeout is
    /// returned as [`ScanError::Timeout`]; lines already handed out stay
    /// valid.
    #[instrument(skip_all)]
    pub fn end(&mut self, regs: &mut RegisterSet) -> Result<()> {
        if self.state == PipelineState::Idle {
            return Ok(());
        }
        self.state = PipelineState::Draining;
        self.cancel.cancel();
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Reader thread panicked");
            }
        }
        if let Some(e) = self.shared.error.lock().take() {
            debug!(error = %e, "Discarding unreported reader error");
        }
        let discarded = self.buffer.as_ref().map_or(0, |b| b.pending());
        self.buffer = None;
        self.raw_lines = 0;

        let result = stop_device(&self.channel, regs, &self.profile);
        self.cancel.reset();
        self.state = PipelineState::Idle;
        debug!(discarded, "Pipeline idle");
        result
    }

    /// Best-effort stop; errors are logged.
    pub fn abort(&mut self, regs: &mut RegisterSet) {
        if let Err(e) = self.end(regs) {
            warn!(error = %e, "Abort did not complete cleanly");
        }
    }
}

impl Drop for AcquisitionPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;
    use scan_core::{ProfileRegistry, ScanRequest};

    fn profile() -> Arc<ModelProfile> {
        ProfileRegistry::builtin().unwrap().get("bh1200").unwrap()
    }

    #[test]
    fn test_stage_geometry() {
        let profile = profile();
        let req = ScanRequest::builder()
            .resolution(300)
            .origin(4, 0)
            .area(120, 10)
            .flags(ScanFlags::LAMP_OFF)
            .build();
        let setup = ScanSetup::resolve(&req, &profile).unwrap();
        let mut regs = RegisterSet::new(RegisterMap::for_family(profile.family));
        let options = ScanOptions {
            motor: true,
            shading: false,
            fast_feed: false,
        };
        stage_geometry(&mut regs, &setup, &profile, options).unwrap();
        let map = regs.map().clone();
        assert_eq!(regs.field(map.dpi), 300);
        assert_eq!(regs.field(map.pixel_count), 120);
        assert_eq!(regs.field(map.start_pixel), setup.start_pixel);
        assert_eq!(regs.field(map.line_count), 10);
        assert_eq!(regs.field(map.channels), 0x11);
        assert_eq!(
            regs.get(map.motor_control.addr).unwrap() & motor_bits::MOTOR_ENABLE,
            motor_bits::MOTOR_ENABLE
        );
        assert_eq!(regs.get(map.lamp.addr).unwrap() & lamp_bits::LAMP_ON, 0);
    }

    #[test]
    fn test_begin_requires_idle_and_lines() {
        let profile = profile();
        let channel: SharedChannel = Arc::new(MemoryChannel::new(64));
        let mut pipeline = AcquisitionPipeline::new(channel, Arc::clone(&profile));
        let req = ScanRequest::builder()
            .resolution(150)
            .flags(ScanFlags::FEED_ONLY)
            .build();
        let setup = ScanSetup::resolve(&req, &profile).unwrap();
        let mut regs = RegisterSet::new(RegisterMap::for_family(profile.family));
        assert!(matches!(
            pipeline.begin(&setup, &mut regs, ScanOptions::default()),
            Err(ScanError::InvalidParameter { .. })
        ));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline.end(&mut regs).is_ok());
    }

    #[test]
    fn test_wait_line_when_idle() {
        let profile = profile();
        let channel: SharedChannel = Arc::new(MemoryChannel::new(64));
        let pipeline = AcquisitionPipeline::new(channel, profile);
        assert!(!pipeline.wait_line(0).unwrap());
        assert!(pipeline.raw_line(0).is_err());
    }
}
