// Translation of lock operations into conditional writes against the store

use crate::{
    error::StoreError,
    storage::LockStore,
    time::{expiry_after, Clock},
    LockerId,
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of one conditional-put on a lock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The record now names us as owner with a fresh expiry.
    Granted,
    /// Another locker holds a live lease.
    Denied,
    /// The store failed for a reason other than the condition.
    Failed(StoreError),
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Nothing of ours to delete: never written, expired and reclaimed, or
    /// already released.
    AlreadyAbsent,
}

/// Issues the conditional writes for one locker identity.
#[derive(Debug)]
pub struct LockProtocol {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    table: String,
    id: LockerId,
    owner: String,
    calls: CancellationToken,
    /// Bumped each time a delete call returns.
    releases: AtomicU64,
}

impl LockProtocol {
    pub fn new(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        table: impl Into<String>,
        id: LockerId,
    ) -> Self {
        Self {
            store,
            clock,
            table: table.into(),
            id,
            owner: id.to_string(),
            calls: CancellationToken::new(),
            releases: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Claims `name` for `timeout`, or extends our existing claim.
    pub async fn attempt_acquire(&self, name: &str, timeout: Duration) -> AcquireOutcome {
        let now = self.clock.now();
        let expire_at = expiry_after(now, timeout);
        debug!(
            locker = %self.id,
            lock = name,
            timeout = ?timeout,
            expire_at,
            "Attempting to acquire lock"
        );

        let result = self
            .guarded(self.store.conditional_put(
                &self.table,
                name,
                &self.owner,
                now.timestamp(),
                expire_at,
            ))
            .await;

        match result {
            Ok(()) => {
                debug!(locker = %self.id, lock = name, expire_at, "Lock granted");
                AcquireOutcome::Granted
            }
            Err(StoreError::ConditionFailed) => {
                debug!(locker = %self.id, lock = name, "Lock denied, held elsewhere");
                AcquireOutcome::Denied
            }
            Err(e) => {
                debug!(locker = %self.id, lock = name, error = %e, "Lock acquisition failed");
                AcquireOutcome::Failed(e)
            }
        }
    }

    /// Deletes our record for `name`. A failed ownership condition counts as
    /// already released.
    pub async fn attempt_release(&self, name: &str) -> Result<ReleaseOutcome, StoreError> {
        debug!(locker = %self.id, lock = name, "Releasing lock");
        let result = self
            .guarded(self.store.conditional_delete(&self.table, name, &self.owner))
            .await;
        self.releases.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(()) => Ok(ReleaseOutcome::Released),
            Err(StoreError::ConditionFailed) => {
                debug!(locker = %self.id, lock = name, "Lock not found when deletion attempted");
                Ok(ReleaseOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e),
        }
    }

    /// Number of release calls that have returned so far.
    ///
    /// A caller reads this before writing a lease. If it has moved by the time
    /// the lease is recorded, one of our deletes may have landed after that
    /// write.
    pub fn release_epoch(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    /// Makes every later store call fail with [`StoreError::Cancelled`].
    pub fn stop_calls(&self) {
        self.calls.cancel();
    }

    pub fn calls_stopped(&self) -> bool {
        self.calls.is_cancelled()
    }

    async fn guarded<F>(&self, call: F) -> Result<(), StoreError>
    where
        F: Future<Output = Result<(), StoreError>>,
    {
        tokio::select! {
            biased;
            () = self.calls.cancelled() => Err(StoreError::Cancelled),
            result = call => result,
        }
    }
}
