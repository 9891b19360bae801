//! Error types for the tracer and the driver boundary
//!
//! Driver calls report a [`DriverError`]; the tracer converts those into
//! [`TracerError`] at the point where a setup or teardown step fails.

use thiserror::Error;

/// Status reported by a failed driver or tracing-layer call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("insufficient privileges")]
    InsufficientPrivileges,

    #[error("max limit reached")]
    MaxLimitReached,

    #[error("tracing layer not initialized")]
    NotInitialized,

    #[error("invalid context")]
    InvalidContext,

    #[error("invalid device")]
    InvalidDevice,

    #[error("malformed activity record: {0}")]
    MalformedRecord(String),

    #[error("{0}")]
    Unknown(String),
}

/// Result type for driver calls
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors surfaced to users of the tracer.
#[derive(Error, Debug)]
pub enum TracerError {
    /// The tracing layer refused a subscription because the process lacks privileges.
    #[error("{call} failed: tracing requires elevated privileges")]
    PermissionDenied { call: &'static str },

    /// The tracing layer or the devices are not usable.
    #[error("tracing layer unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cannot {operation} while tracer is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TracerError {
    /// True when the failure was caused by missing privileges.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TracerError::PermissionDenied { .. })
    }
}

/// Result type for tracer operations
pub type Result<T> = std::result::Result<T, TracerError>;

/// Converts a driver status into a tracer error, logging the failing call.
pub(crate) fn check<T>(call: &'static str, result: DriverResult<T>) -> Result<T> {
    result.map_err(|err| {
        tracing::error!(call, error = %err, "driver call failed");
        match err {
            DriverError::InsufficientPrivileges => TracerError::PermissionDenied { call },
            DriverError::NotInitialized => {
                TracerError::Unavailable(format!("{call}: {err}"))
            }
            other => TracerError::Internal(format!("{call}: {other}")),
        }
    })
}
