//! `scan-driver`
//!
//! Acquisition engine for sensor-control ASIC scanners.
//!
//! # Layers
//!
//! - [`channel`]: command framing per ASIC family, chunked bulk transfers
//! - [`register_set`]: register shadow with dirty-diff flush
//! - [`motion`]: slope tables, z-mode and motor register staging
//! - [`calibration`]: exposure, offset, gain and shading procedures
//! - [`pipeline`]: scan state machine, reader thread and [`TransferBuffer`]
//! - [`reconstruct`]: channel/row alignment, gamma and depth packing
//! - [`session`]: [`DeviceSession`], tying the layers together
//!
//! Everything is synchronous. The only background thread is the pipeline's
//! reader; cancellation goes through a shared [`CancelToken`].

pub mod buffer;
pub mod calibration;
pub mod channel;
pub mod chunk;
pub mod gamma;
pub mod motion;
pub mod pipeline;
pub mod poll;
pub mod reconstruct;
pub mod register_set;
pub mod session;
pub mod status;

#[cfg(test)]
mod testing;

pub use buffer::TransferBuffer;
pub use calibration::{
    AnalogParams, CalibrationEngine, CalibrationReport, CalibrationState, Outcome, ShadingTable,
};
pub use channel::{open_channel, BulkHeaderChannel, CommandChannel, ControlPacketChannel, SharedChannel};
pub use chunk::{split_chunk, ChunkPlan, ChunkSplit};
pub use gamma::GammaTables;
pub use motion::{MotionPlan, SlopeTable, ZMode};
pub use pipeline::{AcquisitionPipeline, PipelineState, ScanOptions};
pub use poll::{CancelToken, Poller};
pub use reconstruct::{LineReconstructor, ScanLine};
pub use register_set::RegisterSet;
pub use session::DeviceSession;
