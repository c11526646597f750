//! Custom error types for the library.
//!
//! This module defines the primary error type, `DaqError`. Using the `thiserror`
//! crate, it gives every layer of the controller framework one consistent error
//! vocabulary, from lock contention to transport and configuration problems.
//!
//! ## Error Hierarchy
//!
//! - **`LockTimeout`**: the bounded lock guarding a transport was not acquired in
//!   time. Soft failure; the caller skips this cycle and retries on the next poll.
//! - **`TransportOpen`**: opening the physical channel or the device handshake failed.
//!   The controller falls back to `Uninitialized`.
//! - **`Read`**: a single read cycle failed (I/O, malformed response, device error
//!   status). The affected channel degrades to `NaN`.
//! - **`Write`**: applying a value to the device failed. Reported, no state change.
//! - **`NotConnected`**: a hardware call was attempted without a live transport.
//! - **`FeatureNotEnabled`**: the transport needed by a device was not compiled in.
//! - **`Config`** / **`Configuration`**: loading or validating settings failed.
//!
//! A transport left open by a close timeout has no variant: it is logged at
//! WARNING and never raised.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised anywhere in the controller framework.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Bounded lock acquisition timed out.
    #[error("Lock not acquired within {waited:?}: {message}")]
    LockTimeout { message: String, waited: Duration },

    /// Opening a transport or the handshake failed.
    #[error("Failed to open transport '{resource}': {reason}")]
    TransportOpen { resource: String, reason: String },

    /// One read went wrong.
    #[error("Read failed: {0}")]
    Read(String),

    /// One write went wrong.
    #[error("Write failed: {0}")]
    Write(String),

    /// No live transport.
    #[error("Transport not connected")]
    NotConnected,

    /// The transport needed was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration is inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not valid in the current controller state.
    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState { operation: String, state: String },
}

impl DaqError {
    /// Wraps any displayable cause as a read failure.
    pub fn read(cause: impl std::fmt::Display) -> Self {
        DaqError::Read(cause.to_string())
    }

    /// Wraps any displayable cause as a write failure.
    pub fn write(cause: impl std::fmt::Display) -> Self {
        DaqError::Write(cause.to_string())
    }

    /// Builds a transport-open failure for `resource`.
    pub fn open(resource: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        DaqError::TransportOpen {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that mean the link itself is gone rather than one bad answer.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DaqError::NotConnected | DaqError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Read("malformed response '0,abc'".to_string());
        assert_eq!(err.to_string(), "Read failed: malformed response '0,abc'");
    }

    #[test]
    fn test_lock_timeout_display() {
        let err = DaqError::LockTimeout {
            message: "Could not acquire lock before closing port.".into(),
            waited: Duration::from_secs(1),
        };
        let text = err.to_string();
        assert!(text.contains("1s"));
        assert!(text.contains("closing port"));
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(DaqError::NotConnected.is_disconnect());
        assert!(DaqError::Io(std::io::Error::other("gone")).is_disconnect());
        assert!(!DaqError::read("bad status").is_disconnect());
    }
}
