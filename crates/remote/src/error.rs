//! Remote Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A remote catalog error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for remote catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection failed, timed out, or the service answered with a 5xx.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// The requested id does not exist upstream (404-equivalent).
    #[display("not found upstream: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The service asked us to slow down.
    #[display("rate limited")]
    RateLimited,
    /// The service answered, but with something we could not understand.
    #[display("invalid response: {_0}")]
    InvalidResponse(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited)
    }
}
