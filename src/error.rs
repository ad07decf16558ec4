//! Error types for the measurement system.
//!
//! `DaqError` is the typed error taxonomy shared by the transport, driver and
//! measurement layers. Most code propagates `anyhow::Result` and converts into
//! these variants at the layer boundaries where the distinction matters:
//!
//! - `Resource`: a transport-level fault (connection drop, VISA timeout,
//!   malformed response). Only these are retryable by the auto-reconnect
//!   policy in [`crate::resource`].
//! - `Driver`: a fault raised while talking to an instrument, tagged with the
//!   originating driver for diagnostics.
//! - `Instrument`: a non-zero error code read back from an instrument's own
//!   error queue. Never silently ignored.
//! - `Precondition`: a configuration problem caught before any instrument I/O.
//! - `ComplianceTripped`: the source hit its current limit and the run is not
//!   configured to tolerate it.
//! - `Timeout`: a bounded fetch-poll loop exceeded its wall-clock budget.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Resource error on '{resource}': {message}")]
    Resource { resource: String, message: String },

    #[error("Driver error ({driver}): {message}")]
    Driver { driver: String, message: String },

    #[error("Instrument error {code}: {message}")]
    Instrument { code: i32, message: String },

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Current compliance tripped")]
    ComplianceTripped,

    #[error("Operation timed out after {:.2} s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Helper for wrapping a transport fault with its resource name.
    pub fn resource(resource: impl Into<String>, message: impl ToString) -> Self {
        DaqError::Resource {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Helper for tagging a fault with the driver it originated from.
    pub fn driver(driver: impl Into<String>, message: impl ToString) -> Self {
        DaqError::Driver {
            driver: driver.into(),
            message: message.to_string(),
        }
    }

    /// Connection-class errors are the only ones the auto-reconnect policy
    /// retries; protocol or semantic errors re-raise immediately.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DaqError::Resource { .. } | DaqError::Io(_))
    }
}

/// Returns true if any error in the chain is a retryable connection fault.
pub fn is_connection_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<DaqError>()
            .map(DaqError::is_connection_error)
            .unwrap_or(false)
            || cause.downcast_ref::<std::io::Error>().is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::driver("K2410", "query failed");
        assert_eq!(err.to_string(), "Driver error (K2410): query failed");

        let err = DaqError::Instrument {
            code: -113,
            message: "Undefined header".into(),
        };
        assert!(err.to_string().contains("-113"));
    }

    #[test]
    fn test_connection_classification() {
        assert!(DaqError::resource("GPIB0::16::INSTR", "dropped").is_connection_error());
        assert!(!DaqError::Precondition("no source".into()).is_connection_error());
        assert!(!DaqError::ComplianceTripped.is_connection_error());
    }

    #[test]
    fn test_connection_classification_through_anyhow_chain() {
        let err = anyhow::Error::new(DaqError::resource("ASRL2", "gone"))
            .context("while reading current");
        assert!(is_connection_error(&err));

        let err = anyhow::Error::new(DaqError::ComplianceTripped).context("step 12");
        assert!(!is_connection_error(&err));
    }
}
