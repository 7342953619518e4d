//! Simulated scanner hardware for scan-engine.
//!
//! [`SimulatedScanner`] implements [`scan_core::Transport`] for both command
//! framing families, so the whole driver stack can run without a device:
//!
//! ```no_run
//! use scan_driver_mock::{fast_profile, SimulatedScanner};
//!
//! let profile = fast_profile("bh1200").unwrap();
//! let device = SimulatedScanner::new(profile.clone());
//! let probe = device.probe();
//! let transport = device.boxed();
//! # let _ = (probe, transport);
//! ```
//!
//! Failures are injected with an [`ErrorConfig`]; noise and the page under
//! the sensor come from [`SimulatorConfig`].

pub mod device;
pub mod errors;
pub mod noise;

use std::sync::Arc;

use scan_core::{ModelProfile, ProfileRegistry, Result};

pub use device::{DeviceProbe, PageModel, SimulatedScanner, SimulatorConfig};
pub use errors::{ErrorConfig, ErrorScenario};
pub use noise::SensorNoise;

/// Built-in profile with polling intervals cut to a millisecond, for tests
/// against the simulator.
pub fn fast_profile(model: &str) -> Result<Arc<ModelProfile>> {
    let mut profile = ProfileRegistry::builtin()?.get(model)?.as_ref().clone();
    let timing = &mut profile.timing;
    timing.data_poll_interval_ms = 1;
    timing.stop_poll_interval_ms = 1;
    timing.home_poll_interval_ms = 1;
    timing.feed_poll_interval_ms = 1;
    timing.consumer_wait_us = 50;
    timing.warmup_interval_ms = 1;
    Ok(Arc::new(profile))
}
