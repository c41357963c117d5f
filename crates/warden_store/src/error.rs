// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for store operations.

/// An error from a key-value store operation.
///
/// Stores classify failures into two kinds. Callers in this workspace never retry either kind;
/// they propagate them as-is.
///
/// # Example
///
/// ```
/// use warden_store::StoreError;
///
/// let error = StoreError::connection("connection refused");
/// assert!(error.is_connection());
/// ```
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unreachable: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The store was reached but rejected the command.
    #[error("store command failed: {0}")]
    Command(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Creates a connection error from any error-like cause.
    pub fn connection(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Connection(cause.into())
    }

    /// Creates a command error from any error-like cause.
    pub fn command(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Command(cause.into())
    }

    /// Returns `true` when the store was unreachable.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// A specialized [`Result`] type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
