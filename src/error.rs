//! Custom error types for the rig controller.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the sequencer
//! distinguishes:
//!
//! - **`Config`**: wraps errors from the `config` crate, typically file
//!   parsing or format issues in the configuration files.
//! - **`Configuration`**: semantic errors in the configuration, values that
//!   parse fine but are logically invalid (e.g. a turbo-start pressure below
//!   the ion-gauge activation pressure). Caught during the validation step.
//! - **`Device`**: a hardware command failed and stayed failed after the
//!   retry executor exhausted its attempts.
//! - **`Interlock`**: an operation was refused because a prerequisite device
//!   state did not hold. Never retried, never silently skipped.
//! - **`Timeout`**: a bounded wait elapsed without its condition being met.
//!   Escalates to the owning stage's failure edge.
//! - **`Cancelled`**: the operator requested a stop while a wait or stage was
//!   in flight. Distinct from `Timeout` so callers can tell "operator
//!   aborted" from "hardware never got there".
//!
//! By using `#[from]`, `RigError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum RigError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device command failed after all retries were exhausted.
    #[error("Device error: {0}")]
    Device(String),

    /// A prerequisite device state did not hold for the requested operation.
    #[error("Interlock violated: {0}")]
    Interlock(String),

    /// A bounded wait elapsed without its condition being met.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The operator requested a stop while the run was in flight.
    #[error("Run cancelled by operator")]
    Cancelled,
}

impl RigError {
    /// Whether this error is fatal for the run, as opposed to a stage
    /// timeout. Both take the failure edge; the distinction only affects
    /// how the error is reported.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RigError::Timeout(_) | RigError::Cancelled)
    }
}
