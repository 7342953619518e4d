//! `scan-core`
//!
//! Shared building blocks for the scanner acquisition engine.
//!
//! ## Key Types
//!
//! - [`Transport`]: byte-exact bus handle supplied by the host
//! - [`AsicFamily`]: which command framing a device speaks
//! - [`RegisterMap`]: logical register layout per family
//! - [`ModelProfile`]: static sensor and motor constants, loaded from TOML
//! - [`ScanSetup`]: validated scan geometry derived from a [`ScanRequest`]
//! - [`ScanError`]: error type with a coarse [`ScanErrorKind`]

pub mod config;
pub mod error;
pub mod profile;
pub mod protocol;
pub mod registers;
pub mod setup;
pub mod transport;

pub use config::{load_profiles, load_profiles_from_str, ConfigLoadError, ProfileRegistry};
pub use error::{Result, ScanError, ScanErrorKind};
pub use profile::{
    CalibrationTargets, ColorOrder, DualRowPhase, ModelProfile, MotorProfile, PollTiming,
    SensorProfile, SlopeCurve, StepMode, TransferLimits,
};
pub use protocol::{AddressWindow, AsicFamily, RamTarget, TransferDirection};
pub use registers::{MotionFlags, RegisterField, RegisterMap, StatusAccess, StatusFlags};
pub use setup::{ColorFilter, ScanFlags, ScanRequest, ScanSetup};
pub use transport::{BoxedTransport, ControlRequest, Transport};
