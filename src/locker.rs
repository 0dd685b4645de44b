use crate::{
    config::LockerConfig,
    coordinator::{Command, Coordinator, CoordinatorState, Recorded, Snapshot, Status},
    error::{FatalError, StoreError},
    lease::HeldLock,
    protocol::{AcquireOutcome, LockProtocol},
    storage::LockStore,
    time::{Clock, SystemClock},
    Error, LockerId, Result,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to one locker instance.
///
/// Cloning is cheap and every clone talks to the same coordinator task. The
/// coordinator drains (releases every held lock) when [`Locker::close`] is
/// called, when the lifetime token passed at construction is cancelled, or
/// when the last clone is dropped.
///
/// Must be created inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct Locker {
    protocol: Arc<LockProtocol>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    shutdown: CancellationToken,
    min_lock_timeout: Duration,
}

impl Locker {
    /// Starts a locker on `table` with the default configuration.
    pub fn new(
        store: Arc<dyn LockStore>,
        lifetime: &CancellationToken,
        table: impl Into<String>,
    ) -> Self {
        let config = LockerConfig::new(table);
        Self::start(store, Arc::new(SystemClock), lifetime, &config)
    }

    pub fn with_config(
        store: Arc<dyn LockStore>,
        lifetime: &CancellationToken,
        config: &LockerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::start(store, Arc::new(SystemClock), lifetime, config))
    }

    /// Like [`Locker::with_config`], stamping expiries from `clock`.
    pub fn with_clock(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        lifetime: &CancellationToken,
        config: &LockerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::start(store, clock, lifetime, config))
    }

    fn start(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        lifetime: &CancellationToken,
        config: &LockerConfig,
    ) -> Self {
        let id = LockerId::new();
        let protocol = Arc::new(LockProtocol::new(store, clock, &config.table_name, id));
        // Store calls stay on the protocol's own token, so a cancelled
        // lifetime still lets the drain release its locks.
        let shutdown = lifetime.child_token();
        let handle = Coordinator::spawn(
            protocol.clone(),
            config.heartbeat_interval,
            config.fatal_policy,
            shutdown.clone(),
        );
        debug!(locker = %id, table = %config.table_name, "Locker started");

        Self {
            protocol,
            commands: handle.commands,
            status: handle.status,
            shutdown,
            min_lock_timeout: config.min_lock_timeout,
        }
    }

    pub fn id(&self) -> LockerId {
        self.protocol.id()
    }

    pub fn table(&self) -> &str {
        self.protocol.table()
    }

    /// Tries once to take `name` for `timeout`.
    ///
    /// Returns `Ok(true)` once the lease is granted and tracked for renewal,
    /// `Ok(false)` if another locker holds a live lease. Acquiring a lock this
    /// locker already holds renews it, returns `Ok(true)` and renews on the new
    /// `timeout` from then on.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] when the store fails, [`Error::InvalidTimeout`] for a
    /// timeout below the configured minimum, and [`Error::Closed`] or
    /// [`Error::Fatal`] once the coordinator has stopped.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<bool> {
        if timeout < self.min_lock_timeout {
            return Err(Error::InvalidTimeout {
                timeout,
                min: self.min_lock_timeout,
            });
        }
        self.ensure_running()?;

        let epoch = self.protocol.release_epoch();
        match self.protocol.attempt_acquire(name, timeout).await {
            AcquireOutcome::Granted => self.record(name, timeout, epoch).await,
            AcquireOutcome::Denied => Ok(false),
            AcquireOutcome::Failed(StoreError::Cancelled) => Err(self.stopped_error()),
            AcquireOutcome::Failed(e) => Err(Error::Store(e)),
        }
    }

    /// Asks the coordinator to release `name`. Does not wait for the store.
    /// Unknown names and calls after close are ignored.
    pub fn release(&self, name: &str) {
        if self
            .commands
            .send(Command::Release {
                name: name.to_string(),
            })
            .is_err()
        {
            debug!(locker = %self.id(), lock = name, "Release after stop ignored");
        }
    }

    /// Starts shutdown and returns immediately; held locks are released in the
    /// background. Await [`Locker::closed`] to wait for that to finish.
    pub fn close(&self) {
        debug!(locker = %self.id(), "Close requested");
        self.shutdown.cancel();
    }

    /// Waits until the coordinator has stopped, returning the fatal error that
    /// stopped it, if any.
    pub async fn closed(&self) -> Option<FatalError> {
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|status| status.state == CoordinatorState::Stopped)
            .await;
        let fatal = status.borrow().fatal.clone();
        fatal
    }

    pub fn state(&self) -> CoordinatorState {
        self.status.borrow().state
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        self.status.borrow().fatal.clone()
    }

    /// Locks the coordinator currently renews.
    pub async fn held_locks(&self) -> Result<Vec<HeldLock>> {
        Ok(self.snapshot().await?.held)
    }

    /// Current renewal cadence.
    pub async fn heartbeat_interval(&self) -> Result<Duration> {
        Ok(self.snapshot().await?.heartbeat_interval)
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| self.stopped_error())?;
        rx.await.map_err(|_| self.stopped_error())
    }

    async fn record(&self, name: &str, timeout: Duration, epoch: u64) -> Result<bool> {
        let (ack, acked) = oneshot::channel();
        let lock = HeldLock::new(name, timeout);
        if self.commands.send(Command::Record { lock, epoch, ack }).is_ok() {
            match acked.await {
                Ok(Recorded::Tracked) => return Ok(true),
                Ok(Recorded::Lost) => return Ok(false),
                Ok(Recorded::Failed(e)) => return Err(Error::Store(e)),
                Ok(Recorded::Drained) => return Err(self.stopped_error()),
                Err(_) => {}
            }
        }

        // The coordinator stopped before tracking the lease; nobody will renew it.
        if let Err(e) = self.protocol.attempt_release(name).await {
            debug!(locker = %self.id(), lock = name, error = %e, "Untracked lease left to expire");
        }
        Err(self.stopped_error())
    }

    fn ensure_running(&self) -> Result<()> {
        let running = self.status.borrow().state == CoordinatorState::Running;
        if running && !self.shutdown.is_cancelled() {
            Ok(())
        } else {
            Err(self.stopped_error())
        }
    }

    fn stopped_error(&self) -> Error {
        match self.fatal_error() {
            Some(fatal) => Error::Fatal(fatal),
            None => Error::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FatalPolicy, storage::InMemoryLockStore, test_utils::InstrumentedStore,
        time::ManualClock,
    };

    fn report_config() -> LockerConfig {
        LockerConfig::new("locks").with_fatal_policy(FatalPolicy::Report)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = Arc::new(InMemoryLockStore::new());
        let lifetime = CancellationToken::new();
        let locker = Locker::with_config(store.clone(), &lifetime, &report_config()).unwrap();

        assert!(locker.acquire("job-7", Duration::from_secs(10)).await.unwrap());
        assert_eq!(
            store.get("locks", "job-7").unwrap().owner,
            locker.id().to_string()
        );
        assert_eq!(locker.held_locks().await.unwrap().len(), 1);

        locker.release("job-7");
        assert!(locker.held_locks().await.unwrap().is_empty());
        assert!(store.get("locks", "job-7").is_none());
    }

    #[tokio::test]
    async fn test_reacquire_does_not_duplicate() {
        let store = Arc::new(InMemoryLockStore::new());
        let lifetime = CancellationToken::new();
        let locker = Locker::with_config(store, &lifetime, &report_config()).unwrap();

        for _ in 0..3 {
            assert!(locker.acquire("job-7", Duration::from_secs(10)).await.unwrap());
        }
        assert_eq!(
            locker.held_locks().await.unwrap(),
            vec![HeldLock::new("job-7", Duration::from_secs(10))]
        );
    }

    #[tokio::test]
    async fn test_short_timeout_rejected() {
        let store = Arc::new(InMemoryLockStore::new());
        let lifetime = CancellationToken::new();
        let locker = Locker::new(store.clone(), &lifetime, "locks");

        let err = locker
            .acquire("job-7", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTimeout { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_error_is_returned_and_state_untouched() {
        let store = Arc::new(InstrumentedStore::new(Arc::new(InMemoryLockStore::new())));
        let lifetime = CancellationToken::new();
        let locker = Locker::with_config(store.clone(), &lifetime, &report_config()).unwrap();

        store.fail_puts(StoreError::Throttled);
        let err = locker.acquire("job-7", Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Throttled)));
        assert!(locker.held_locks().await.unwrap().is_empty());
        assert_eq!(locker.state(), CoordinatorState::Running);

        store.heal();
        assert!(locker.acquire("job-7", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects_further_calls() {
        let store = Arc::new(InMemoryLockStore::new());
        let lifetime = CancellationToken::new();
        let locker = Locker::with_config(store.clone(), &lifetime, &report_config()).unwrap();

        assert!(locker.acquire("a", Duration::from_secs(10)).await.unwrap());
        assert!(locker.acquire("b", Duration::from_secs(10)).await.unwrap());

        locker.close();
        assert_eq!(locker.closed().await, None);
        assert!(store.is_empty());
        assert_eq!(locker.state(), CoordinatorState::Stopped);

        assert!(matches!(
            locker.acquire("a", Duration::from_secs(10)).await,
            Err(Error::Closed)
        ));
        assert!(store.is_empty());
        // Release after close is silently ignored
        locker.release("a");
        assert!(matches!(locker.held_locks().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_closed_pending_until_close() {
        let store = Arc::new(InMemoryLockStore::new());
        let lifetime = CancellationToken::new();
        let locker = Locker::with_config(store, &lifetime, &report_config()).unwrap();

        let mut closed = tokio_test::task::spawn(locker.closed());
        tokio_test::assert_pending!(closed.poll());
        assert_eq!(locker.state(), CoordinatorState::Running);

        locker.close();
        assert_eq!(locker.closed().await, None);
        assert!(closed.poll().is_ready());
    }

    #[tokio::test]
    async fn test_lifetime_cancellation_drains() {
        let store = Arc::new(InMemoryLockStore::new());
        let lifetime = CancellationToken::new();
        let locker = Locker::with_config(store.clone(), &lifetime, &report_config()).unwrap();

        assert!(locker.acquire("job-7", Duration::from_secs(10)).await.unwrap());
        lifetime.cancel();
        assert_eq!(locker.closed().await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_drains() {
        let store = Arc::new(InMemoryLockStore::new());
        let lifetime = CancellationToken::new();
        let locker = Locker::with_config(store.clone(), &lifetime, &report_config()).unwrap();
        let watcher = locker.status.clone();

        assert!(locker.acquire("job-7", Duration::from_secs(10)).await.unwrap());
        drop(locker);

        let mut watcher = watcher;
        watcher
            .wait_for(|status| status.state == CoordinatorState::Stopped)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stolen_lease_is_reported_fatal() {
        let store = Arc::new(InMemoryLockStore::new());
        let clock = Arc::new(ManualClock::new());
        let lifetime = CancellationToken::new();
        let a = Locker::with_clock(store.clone(), clock.clone(), &lifetime, &report_config())
            .unwrap();
        let b = Locker::with_clock(store.clone(), clock.clone(), &lifetime, &report_config())
            .unwrap();

        assert!(a.acquire("job-1", Duration::from_secs(4)).await.unwrap());
        // A's lease lapses in store time before its next renewal fires
        clock.advance(Duration::from_secs(6));
        assert!(b.acquire("job-1", Duration::from_secs(30)).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        let fatal = a.closed().await;
        assert!(matches!(fatal, Some(FatalError::RenewalDenied { ref lock, .. }) if lock == "job-1"));
        assert!(matches!(
            a.acquire("other", Duration::from_secs(10)).await,
            Err(Error::Fatal(_))
        ));
        // B still owns the record
        assert_eq!(store.get("locks", "job-1").unwrap().owner, b.id().to_string());
    }
}
