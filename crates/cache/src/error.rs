//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Two families live here:
//! - [`Error`]/[`ErrorKind`] for operations that return to their caller
//!   (database access, library syncs, ratings).
//! - [`FetchError`], the cloneable summary stored inside
//!   [`CacheState::Error`](crate::CacheState::Error) so that observers never
//!   have to handle an error tree.

use derive_more::{Display, Error};
use melo_remote::error::{Error as RemoteError, ErrorKind as RemoteErrorKind};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Stored data could not be converted back into a model.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The remote catalog failed; the child frame says how.
    #[display("remote catalog error")]
    Remote,
    /// A caller broke a precondition (empty id, rating out of range, ...).
    #[display("validation failed: {_0}")]
    Validation(#[error(not(source))] String),
    /// The owning scope was cancelled before the operation finished.
    #[display("operation cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Remote)
    }
}

/// Why a fetch cycle ended in [`CacheState::Error`](crate::CacheState::Error).
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The network call failed; an explicit refresh may succeed.
    #[display("network failure: {_0}")]
    NetworkFailure(#[error(not(source))] String),
    /// The id does not exist upstream. Never retried automatically.
    #[display("not found upstream: {_0}")]
    NotFoundRemote(#[error(not(source))] String),
    /// Persisting or reading the local copy failed.
    #[display("store failure: {_0}")]
    StoreFailure(#[error(not(source))] String),
    #[display("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Returns `true` if a caller-driven retry might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_) | Self::StoreFailure(_))
    }

    pub(crate) fn from_remote(err: &RemoteError) -> Self {
        match &**err {
            RemoteErrorKind::NotFound(id) => Self::NotFoundRemote(id.clone()),
            kind => Self::NetworkFailure(kind.to_string()),
        }
    }

    pub(crate) fn from_store(err: &Error) -> Self {
        Self::StoreFailure(err.to_string())
    }
}
