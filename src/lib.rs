#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Distributed lease locks coordinated through conditional writes on a shared
//! key-value table.
//!
//! Each [`Locker`] owns a coordinator task that tracks the locks it holds and
//! renews their leases on a timer derived from the tightest timeout held.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod locker;
pub mod protocol;
pub mod storage;
pub mod time;

pub mod test_utils;

pub use config::{FatalPolicy, LockerConfig};
pub use error::{Error, FatalError, Result, StoreError};
pub use lease::{HeldLock, LockRecord};
pub use locker::Locker;
pub use storage::{InMemoryLockStore, LockStore};

/// Identity of one locker instance, written as the owner of every record it claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LockerId(pub uuid::Uuid);

impl LockerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for LockerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
