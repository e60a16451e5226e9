//! Error types for portico
//!
//! Three-way taxonomy: transient failures keep the last good snapshot and
//! recover on the next natural trigger; integrity failures discard the
//! offending payload wholesale; navigation failures degrade to logged no-ops.

use thiserror::Error;

/// Error types for cache, auth, and navigation operations
#[derive(Debug, Error)]
pub enum PorticoError {
    /// Network failure or timeout; the previous snapshot stays in place
    #[error("transient failure: {0}")]
    Transient(String),

    /// A sanitization or shape invariant was violated; the payload is discarded
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// History backend refused a mutation (e.g. sandboxed context)
    #[error("navigation failure: {0}")]
    Navigation(String),
}

impl From<reqwest::Error> for PorticoError {
    fn from(e: reqwest::Error) -> Self {
        PorticoError::Transient(e.to_string())
    }
}

/// Convenience result type used throughout the crate
pub type Result<T> = std::result::Result<T, PorticoError>;
