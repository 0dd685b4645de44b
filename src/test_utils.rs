use crate::{
    config::{FatalPolicy, LockerConfig},
    error::StoreError,
    locker::Locker,
    storage::{InMemoryLockStore, LockStore},
    time::ManualClock,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Wraps a store to count calls per lock name and inject failures.
#[derive(Debug)]
pub struct InstrumentedStore {
    inner: Arc<dyn LockStore>,
    puts: DashMap<String, usize>,
    deletes: DashMap<String, usize>,
    put_fault: Mutex<Option<StoreError>>,
    delete_fault: Mutex<Option<StoreError>>,
    latency: Option<Duration>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<dyn LockStore>) -> Self {
        Self {
            inner,
            puts: DashMap::new(),
            deletes: DashMap::new(),
            put_fault: Mutex::new(None),
            delete_fault: Mutex::new(None),
            latency: None,
        }
    }

    /// Delays every call by `latency` before it reaches the inner store.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Conditional puts issued for `name`, including failed ones.
    pub fn puts(&self, name: &str) -> usize {
        self.puts.get(name).map(|count| *count).unwrap_or(0)
    }

    pub fn deletes(&self, name: &str) -> usize {
        self.deletes.get(name).map(|count| *count).unwrap_or(0)
    }

    pub fn total_puts(&self) -> usize {
        self.puts.iter().map(|entry| *entry.value()).sum()
    }

    pub fn total_deletes(&self) -> usize {
        self.deletes.iter().map(|entry| *entry.value()).sum()
    }

    /// Every later put fails with `error` until [`InstrumentedStore::heal`].
    pub fn fail_puts(&self, error: StoreError) {
        *self.put_fault.lock() = Some(error);
    }

    pub fn fail_deletes(&self, error: StoreError) {
        *self.delete_fault.lock() = Some(error);
    }

    pub fn heal(&self) {
        *self.put_fault.lock() = None;
        *self.delete_fault.lock() = None;
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }
    }
}

#[async_trait]
impl LockStore for InstrumentedStore {
    async fn conditional_put(
        &self,
        table: &str,
        name: &str,
        owner: &str,
        now: i64,
        expire_at: i64,
    ) -> Result<(), StoreError> {
        *self.puts.entry(name.to_string()).or_insert(0) += 1;
        self.delay().await;
        let fault = self.put_fault.lock().clone();
        match fault {
            Some(error) => Err(error),
            None => {
                self.inner
                    .conditional_put(table, name, owner, now, expire_at)
                    .await
            }
        }
    }

    async fn conditional_delete(
        &self,
        table: &str,
        name: &str,
        owner: &str,
    ) -> Result<(), StoreError> {
        *self.deletes.entry(name.to_string()).or_insert(0) += 1;
        self.delay().await;
        let fault = self.delete_fault.lock().clone();
        match fault {
            Some(error) => Err(error),
            None => self.inner.conditional_delete(table, name, owner).await,
        }
    }
}

/// A set of lockers contending over one shared in-memory table.
#[derive(Debug)]
pub struct TestCluster {
    pub lockers: Vec<Locker>,
    pub stores: Vec<Arc<InstrumentedStore>>,
    pub memory: Arc<InMemoryLockStore>,
    pub clock: Arc<ManualClock>,
    pub lifetime: CancellationToken,
}

impl TestCluster {
    pub fn store_of(&self, index: usize) -> &Arc<InstrumentedStore> {
        &self.stores[index]
    }

    /// Closes every locker and waits for each drain to finish.
    pub async fn shutdown(&self) {
        self.lifetime.cancel();
        for locker in &self.lockers {
            locker.closed().await;
        }
    }
}

/// Builds `count` lockers on table `"locks"` sharing one store and clock.
///
/// Each locker reaches the store through its own [`InstrumentedStore`] and
/// reports fatal conditions instead of aborting.
pub fn create_test_lockers(count: usize) -> crate::Result<TestCluster> {
    let memory = Arc::new(InMemoryLockStore::new());
    let clock = Arc::new(ManualClock::new());
    let lifetime = CancellationToken::new();
    let config = LockerConfig::new("locks").with_fatal_policy(FatalPolicy::Report);

    let mut lockers = Vec::with_capacity(count);
    let mut stores = Vec::with_capacity(count);
    for _ in 0..count {
        let store = Arc::new(InstrumentedStore::new(memory.clone()));
        let locker = Locker::with_clock(store.clone(), clock.clone(), &lifetime, &config)?;
        stores.push(store);
        lockers.push(locker);
    }

    Ok(TestCluster {
        lockers,
        stores,
        memory,
        clock,
        lifetime,
    })
}
