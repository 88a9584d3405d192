//! Common error types for probe-station.
//!
//! This module provides a centralized Error enum using thiserror. Policy and
//! validation variants are returned to callers before anything is started;
//! environment variants are normally absorbed by the session monitor.

use std::time::Duration;
use thiserror::Error;

/// Main error type for probe-station operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The probe's lock is held by another session
    #[error("Probe #{0} is busy")]
    ProbeBusy(u32),

    /// Caller asked for a transport the target policy does not permit
    #[error("{0}")]
    TransportNotAllowed(String),

    /// The configured policy resolved to a transport the hardware cannot use
    #[error("{0}")]
    TransportPolicyMismatch(String),

    /// Requested transport conflicts with a firmware-fixed probe mode
    #[error("{0}")]
    HardwareModeConflict(String),

    /// Execution environment call failed
    #[error("Execution environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    /// Execution environment call did not finish in time
    #[error("Execution environment call '{call}' timed out after {}s", timeout.as_secs_f32())]
    EnvironmentTimeout { call: String, timeout: Duration },

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    #[error("Unknown probe ID {0}")]
    UnknownProbe(u32),

    #[error("Probe {probe} is not compatible with target {target}")]
    IncompatibleProbe { target: String, probe: u32 },

    #[error("No command defined for target={target}, interface={interface}, mode={mode}")]
    MissingCommand {
        target: String,
        interface: String,
        mode: String,
    },

    #[error("No execution environment configured for target={target}, interface={interface}")]
    MissingEnvironment { target: String, interface: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// True for errors raised by transport policy or hardware validation.
    pub fn is_transport_rejection(&self) -> bool {
        matches!(
            self,
            Error::TransportNotAllowed(_)
                | Error::TransportPolicyMismatch(_)
                | Error::HardwareModeConflict(_)
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
