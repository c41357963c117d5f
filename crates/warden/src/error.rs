// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for the coordinators.

use warden_store::StoreError;

/// An error raised by a coordinator.
///
/// Caller-supplied code (cache-miss resolvers, lock actions, idempotent operations) returns its
/// own error type `E` with `E: From<Error>`. Errors produced by that code pass through the
/// coordinators unmodified; only coordinator failures are converted into `E`. This keeps lock
/// acquisition failures distinguishable from the caller's own failures.
///
/// # Examples
///
/// ```
/// use warden::Error;
///
/// #[derive(Debug)]
/// enum AppError {
///     Coordination(Error),
///     NotFound,
/// }
///
/// impl From<Error> for AppError {
///     fn from(error: Error) -> Self {
///         Self::Coordination(error)
///     }
/// }
///
/// let error = AppError::from(Error::LockContention { keys: vec!["lock:order:1".into()], attempts: 4 });
/// assert!(matches!(error, AppError::Coordination(e) if e.is_lock_contention()));
/// ```
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The backing store failed. Never retried by the coordinators.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A value could not be encoded for, or decoded from, the store.
    #[error("failed to encode or decode a stored value")]
    Codec(#[from] serde_json::Error),

    /// Every attempt to acquire the locks found at least one of them held elsewhere.
    #[error("could not acquire locks {keys:?} after {attempts} attempt(s)")]
    LockContention {
        /// The fully qualified lock keys requested.
        keys: Vec<String>,
        /// The number of attempts made.
        attempts: u32,
    },

    /// A lock being released is held by a different owner.
    ///
    /// This means the lock expired while held and was acquired by someone else; the lock TTL is
    /// too short for the guarded work, or the same lock is released twice.
    #[error("locks {keys:?} are held by another owner")]
    LockOwnershipMismatch {
        /// The fully qualified lock keys held by another owner.
        keys: Vec<String>,
    },

    /// A human-readable duration could not be parsed.
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for [`Error::LockContention`].
    #[must_use]
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }

    /// Returns `true` for [`Error::LockOwnershipMismatch`].
    #[must_use]
    pub fn is_ownership_mismatch(&self) -> bool {
        matches!(self, Self::LockOwnershipMismatch { .. })
    }

    /// Returns `true` when the store could not be reached.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_connection())
    }
}

/// A specialized [`Result`] type for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;
