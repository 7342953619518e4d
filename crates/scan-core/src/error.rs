//! Error types for scanner acquisition.
//!
//! Every fallible operation in the workspace returns [`ScanError`]. Callers
//! that only care about the failure class use [`ScanError::kind`], which
//! separates bus failures from poll timeouts and from requests rejected
//! before any device I/O.

use thiserror::Error;

use crate::config::ConfigLoadError;

/// Result type alias for scanner operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanErrorKind {
    /// Bus or command failure. Fatal to the current operation.
    Transport,
    /// A bounded status poll ran out of attempts. The session stays usable.
    Timeout,
    /// Rejected before any device I/O.
    InvalidParameter,
    /// Profile or configuration file problem.
    Configuration,
}

impl std::fmt::Display for ScanErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScanErrorKind::Transport => "transport",
            ScanErrorKind::Timeout => "timeout",
            ScanErrorKind::InvalidParameter => "invalid_parameter",
            ScanErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// Errors that can occur while driving the scanner.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The transport reported a failure.
    #[error("Transport error during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// A register read came back without the link marker.
    #[error("Link check failed reading register {addr:#06x}: marker {marker:#04x}")]
    LinkCheck { addr: u16, marker: u8 },

    /// A status poll exhausted its attempts.
    #[error("Timed out waiting for {condition} after {attempts} polls")]
    Timeout {
        condition: &'static str,
        attempts: u32,
    },

    /// A request or table index was malformed.
    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: &'static str, message: String },

    /// An operation was issued in the wrong pipeline or session state.
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// Profile loading or validation failed.
    #[error(transparent)]
    Config(#[from] ConfigLoadError),
}

impl ScanError {
    /// Build a transport error.
    pub fn transport(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
        }
    }

    /// Build an invalid-parameter error.
    pub fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            message: message.into(),
        }
    }

    /// Failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ScanErrorKind {
        match self {
            Self::Transport { .. } | Self::LinkCheck { .. } => ScanErrorKind::Transport,
            Self::Timeout { .. } => ScanErrorKind::Timeout,
            Self::InvalidParameter { .. } | Self::InvalidState { .. } => {
                ScanErrorKind::InvalidParameter
            }
            Self::Config(_) => ScanErrorKind::Configuration,
        }
    }

    /// Whether the session may be reused after this error without reopening.
    #[must_use]
    pub fn session_usable(&self) -> bool {
        !matches!(self.kind(), ScanErrorKind::Transport)
    }
}
