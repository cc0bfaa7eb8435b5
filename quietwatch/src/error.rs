// quietwatch/src/error.rs
//
// Error types for stores and the detection core.
//
// Missing data (no baseline, no calendar, account too young) is never an
// error: rules simply return no candidates.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

pub type DetectResult<T> = Result<T, DetectError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown account: {0}")]
    AccountNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An account task panicked or was cancelled, or the worker pool closed.
    #[error("account task failed: {0}")]
    TaskFailed(String),
}
