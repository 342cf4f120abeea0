//! Error types for coordination store operations.
//!
//! Callers only need to tell transient failures (the store could not be
//! reached in time) from everything else; [`StoreError::is_unavailable`]
//! draws that line.

use thiserror::Error;

use crate::store::LeaseId;

#[derive(Debug, Error)]
pub enum StoreError {
    /// transport-level failure talking to the store
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// operation did not complete within its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// the client was never connected
    #[error("not connected: {0}")]
    NotConnected(String),

    /// lease was revoked or expired
    #[error("lease {0:#x} not found")]
    LeaseNotFound(LeaseId),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// true for errors that say nothing about the data in the store, only
    /// that it could not be reached. Retry later, never treat as absence.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::NotConnected(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
