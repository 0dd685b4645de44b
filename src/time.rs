use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = DateTime<Utc>;

/// Wall-clock source used to stamp lease expiries.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// System time shifted by an adjustable offset.
///
/// Lets tests move a locker's notion of "now" past an expiry, or simulate a
/// skewed host, without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn with_skew(skew: Duration) -> Self {
        Self {
            offset_ms: AtomicI64::new(skew.num_milliseconds()),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn offset(&self) -> Duration {
        Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Utc::now() + self.offset()
    }
}

/// Epoch seconds `timeout` after `now`, the format of a record's `expireAt`.
pub fn expiry_after(now: Timestamp, timeout: std::time::Duration) -> i64 {
    Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_add_signed(timeout))
        .map_or(i64::MAX, |expiry| expiry.timestamp())
}
