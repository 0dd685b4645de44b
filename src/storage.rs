use crate::{error::StoreError, lease::LockRecord};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

/// A table of lock records supporting the two atomic writes the protocol needs.
///
/// Implementations must evaluate each condition and apply the write as one
/// atomic step, and must report a failed condition as
/// [`StoreError::ConditionFailed`] rather than as a generic error.
#[async_trait]
pub trait LockStore: Send + Sync + std::fmt::Debug {
    /// Set `owner` and `expire_at` on `name`, only if the record is absent,
    /// already owned by `owner`, or expired as of `now` (epoch seconds).
    async fn conditional_put(
        &self,
        table: &str,
        name: &str,
        owner: &str,
        now: i64,
        expire_at: i64,
    ) -> Result<(), StoreError>;

    /// Remove `name`, only if it is currently owned by `owner`. An absent
    /// record fails the condition too.
    async fn conditional_delete(&self, table: &str, name: &str, owner: &str)
        -> Result<(), StoreError>;
}

/// Lock table kept in process memory, keyed by `(table, name)`.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    records: DashMap<(String, String), LockRecord>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn get(&self, table: &str, name: &str) -> Option<LockRecord> {
        self.records
            .get(&(table.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn records(&self, table: &str) -> Vec<LockRecord> {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == table)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn conditional_put(
        &self,
        table: &str,
        name: &str,
        owner: &str,
        now: i64,
        expire_at: i64,
    ) -> Result<(), StoreError> {
        match self.records.entry((table.to_string(), name.to_string())) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if !record.claimable_by(owner, now) {
                    return Err(StoreError::ConditionFailed);
                }
                record.owner = owner.to_string();
                record.expire_at = expire_at;
            }
            Entry::Vacant(entry) => {
                entry.insert(LockRecord {
                    name: name.to_string(),
                    owner: owner.to_string(),
                    expire_at,
                });
            }
        }
        Ok(())
    }

    async fn conditional_delete(
        &self,
        table: &str,
        name: &str,
        owner: &str,
    ) -> Result<(), StoreError> {
        self.records
            .remove_if(&(table.to_string(), name.to_string()), |_, record| {
                record.owner == owner
            })
            .map(|_| ())
            .ok_or(StoreError::ConditionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_claims_absent_record() {
        let store = InMemoryLockStore::new();
        store.conditional_put("locks", "job-7", "a", 100, 110).await.unwrap();

        let record = store.get("locks", "job-7").unwrap();
        assert_eq!(record.owner, "a");
        assert_eq!(record.expire_at, 110);
    }

    #[tokio::test]
    async fn test_put_respects_live_owner() {
        let store = InMemoryLockStore::new();
        store.conditional_put("locks", "job-7", "a", 100, 110).await.unwrap();

        let denied = store.conditional_put("locks", "job-7", "b", 105, 115).await;
        assert_eq!(denied, Err(StoreError::ConditionFailed));

        // Owner renews, anyone claims once expired
        store.conditional_put("locks", "job-7", "a", 105, 120).await.unwrap();
        assert_eq!(store.get("locks", "job-7").unwrap().expire_at, 120);
        store.conditional_put("locks", "job-7", "b", 121, 131).await.unwrap();
        assert_eq!(store.get("locks", "job-7").unwrap().owner, "b");
    }

    #[tokio::test]
    async fn test_delete_requires_owner() {
        let store = InMemoryLockStore::new();
        store.conditional_put("locks", "job-7", "a", 100, 110).await.unwrap();

        assert_eq!(
            store.conditional_delete("locks", "job-7", "b").await,
            Err(StoreError::ConditionFailed)
        );
        store.conditional_delete("locks", "job-7", "a").await.unwrap();
        assert!(store.is_empty());
        assert_eq!(
            store.conditional_delete("locks", "job-7", "a").await,
            Err(StoreError::ConditionFailed)
        );
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let store = InMemoryLockStore::new();
        store.conditional_put("t1", "job", "a", 0, 10).await.unwrap();
        store.conditional_put("t2", "job", "b", 0, 10).await.unwrap();

        assert_eq!(store.records("t1").len(), 1);
        assert_eq!(store.get("t2", "job").unwrap().owner, "b");
        assert_eq!(store.len(), 2);
    }
}
