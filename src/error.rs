use std::time::Duration;
use thiserror::Error;

/// Outcomes a [`LockStore`](crate::storage::LockStore) reports besides success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The server-side predicate of a conditional write did not hold.
    #[error("Conditional check failed")]
    ConditionFailed,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Request throttled by store")]
    Throttled,

    /// The locker stopped and no longer issues store calls.
    #[error("Store call cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Other(String),
}

/// A broken belief about lock ownership. Once raised the locker stops writing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("Lock {lock:?} held by {locker} was denied on renewal")]
    RenewalDenied { lock: String, locker: crate::LockerId },

    #[error("Lock {lock:?} held by {locker} could not be refreshed: {source}")]
    RenewalFailed {
        lock: String,
        locker: crate::LockerId,
        source: StoreError,
    },

    #[error("Lock {lock:?} held by {locker} could not be released: {source}")]
    ReleaseFailed {
        lock: String,
        locker: crate::LockerId,
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Lock timeout {timeout:?} is below the minimum of {min:?}")]
    InvalidTimeout { timeout: Duration, min: Duration },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Locker is closed")]
    Closed,

    #[error("Locker stopped after fatal error: {0}")]
    Fatal(#[from] FatalError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
