use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default renewal cadence before any short lease tightens it.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// A lease this locker believes it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub name: String,
    pub timeout: Duration,
}

impl HeldLock {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
        }
    }

    /// Slowest renewal cadence that keeps this lease alive with margin.
    pub fn max_renewal_interval(&self) -> Duration {
        self.timeout / 2
    }
}

/// The record persisted in the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub owner: String,
    /// Expiry in epoch seconds.
    #[serde(rename = "expireAt")]
    pub expire_at: i64,
}

impl LockRecord {
    pub fn is_expired(&self, now_epoch_secs: i64) -> bool {
        now_epoch_secs > self.expire_at
    }

    /// Whether `owner` may claim or renew this record at `now_epoch_secs`.
    pub fn claimable_by(&self, owner: &str, now_epoch_secs: i64) -> bool {
        self.owner == owner || self.is_expired(now_epoch_secs)
    }
}

/// Renewal cadence for a held set: half the tightest timeout, capped at `ceiling`.
pub fn renewal_interval<'a>(
    held: impl IntoIterator<Item = &'a HeldLock>,
    ceiling: Duration,
) -> Duration {
    held.into_iter()
        .map(HeldLock::max_renewal_interval)
        .fold(ceiling, Duration::min)
}
