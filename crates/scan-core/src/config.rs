//! Model profile loading.
//!
//! Profiles live in a TOML file keyed by model id:
//!
//! ```toml
//! [profiles.cp1200]
//! family = "control_packet"
//! ...
//! ```
//!
//! [`load_profiles`] layers environment overrides on top of the file using
//! the `SCAN_` prefix with `__` as the nesting separator, e.g.
//! `SCAN_PROFILES__CP1200__TIMING__DATA_POLL_ATTEMPTS=50`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::ModelProfile;

/// Profiles shipped with the driver.
const BUILTIN_PROFILES: &str = include_str!("../profiles/builtin.toml");

/// Errors raised while loading or validating profiles.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// Profile file does not exist.
    #[error("Profile file not found: {0}")]
    NotFound(String),

    /// Profile file could not be read.
    #[error("Failed to read profile file: {0}")]
    ReadError(String),

    /// Profile TOML is malformed.
    #[error("Failed to parse profiles: {0}")]
    ParseError(String),

    /// A profile failed validation.
    #[error("Profile validation failed: {0}")]
    ValidationError(String),

    /// No profile exists for the requested model.
    #[error("Unknown scanner model: {0}")]
    UnknownModel(String),
}

/// On-disk layout of a profile file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileFile {
    /// Profiles keyed by model id.
    #[serde(default)]
    pub profiles: BTreeMap<String, ModelProfile>,
}

/// Validated profiles, shared by reference.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Arc<ModelProfile>>,
}

impl ProfileRegistry {
    /// Registry holding the built-in profiles.
    pub fn builtin() -> Result<Self, ConfigLoadError> {
        load_profiles_from_str(BUILTIN_PROFILES)
    }

    /// Look up a model.
    pub fn get(&self, model: &str) -> Result<Arc<ModelProfile>, ConfigLoadError> {
        self.profiles
            .get(model)
            .cloned()
            .ok_or_else(|| ConfigLoadError::UnknownModel(model.to_string()))
    }

    /// Known model ids, sorted.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Add or replace profiles from `other`.
    pub fn extend(&mut self, other: ProfileRegistry) {
        self.profiles.extend(other.profiles);
    }

    /// Number of profiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// True when no profiles are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn from_file(file: ProfileFile) -> Result<Self, ConfigLoadError> {
        let mut profiles = BTreeMap::new();
        for (key, mut profile) in file.profiles {
            if profile.model.is_empty() {
                profile.model = key.clone();
            }
            profile.validate()?;
            profiles.insert(key, Arc::new(profile));
        }
        Ok(Self { profiles })
    }
}

/// Load profiles from a TOML file, with `SCAN_` environment overrides.
pub fn load_profiles(path: impl AsRef<Path>) -> Result<ProfileRegistry, ConfigLoadError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }

    let file: ProfileFile = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("SCAN_").split("__"))
        .extract()
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;

    let registry = ProfileRegistry::from_file(file)?;
    tracing::debug!(path = %path.display(), profiles = registry.len(), "Loaded scanner profiles");
    Ok(registry)
}

/// Load profiles from a TOML string.
pub fn load_profiles_from_str(toml_str: &str) -> Result<ProfileRegistry, ConfigLoadError> {
    let file: ProfileFile =
        toml::from_str(toml_str).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
    ProfileRegistry::from_file(file)
}
