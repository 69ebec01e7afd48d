//! Custom error types for the application.
//!
//! `HubError` consolidates the failure classes the server can hit: serial
//! link trouble, permission refusals, payload validation, unknown session
//! lookups, and configuration problems. None of these are fatal to the
//! process; every variant stays contained to the request or connection that
//! produced it.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type HubResult<T> = std::result::Result<T, HubError>;

/// Primary error type for the shock-hub application.
#[derive(Error, Debug)]
pub enum HubError {
    /// Serial endpoint open/write failure. Recovered by forcing the link to
    /// `Disconnected` and waiting for a manual or periodic reconnect.
    #[error("Link error: {0}")]
    Link(String),

    /// Caller's role is insufficient for the requested action. Surfaced to
    /// the requesting client only; no state change.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Malformed payload or out-of-range setting. Carries the specific
    /// constraint that was violated; no partial mutation has happened.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation referenced a session identity that does not exist.
    #[error("Unknown session: {0}")]
    NotFound(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
