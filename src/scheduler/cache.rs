//! In-memory state cache with read-through to storage.
//!
//! The scheduler asks for task statuses far more often than they change.
//! [`StateCache`] keeps the latest known value per key and can refresh an
//! entry from the [`Storage`] backend on demand.
//!
//! Only the key and value types listed in this module can be cached. Both
//! traits are sealed, and [`StateCache::pull_from_database`] matches on the
//! concrete key kind to know which table to read.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::core::types::{TimestampParseError, parse_timestamp};
use crate::storage::{Storage, StorageError};

use super::types::{DagRun, DagRunTask, DagRunTaskState, DagRunTaskStatus, StatusParseError};

/// Errors that can occur when using the state cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `add` was called for a key that is already cached.
    #[error("key already exists in the cache: {0}")]
    KeyExists(String),

    /// The key is not cached.
    #[error("key does not exist in the cache: {0}")]
    KeyNotFound(String),

    /// The key kind has no backing table to pull from.
    #[error("unsupported key type for database pull: {0}")]
    UnsupportedKeyType(&'static str),

    /// Cache lock was poisoned.
    #[error("cache lock poisoned")]
    LockPoisoned,

    /// Storage error while pulling.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stored status string is not a known status.
    #[error(transparent)]
    InvalidStatus(#[from] StatusParseError),

    /// Stored timestamp could not be parsed.
    #[error(transparent)]
    TimestampParse(#[from] TimestampParseError),
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::DagRun {}
    impl Sealed for super::DagRunTask {}
    impl Sealed for super::DagRunTaskState {}
}

/// Borrowed view of a cache key, one variant per cacheable key type.
#[derive(Debug, Clone, Copy)]
pub enum CacheableKey<'a> {
    DagRun(&'a DagRun),
    DagRunTask(&'a DagRunTask),
}

/// Types usable as keys of a [`StateCache`].
pub trait CacheKey: sealed::Sealed + Clone + Eq + Hash + fmt::Display + Send + Sync {
    fn as_cacheable(&self) -> CacheableKey<'_>;
}

impl CacheKey for DagRun {
    fn as_cacheable(&self) -> CacheableKey<'_> {
        CacheableKey::DagRun(self)
    }
}

impl CacheKey for DagRunTask {
    fn as_cacheable(&self) -> CacheableKey<'_> {
        CacheableKey::DagRunTask(self)
    }
}

/// Types usable as values of a [`StateCache`].
pub trait CacheValue: sealed::Sealed + Clone + Send + Sync {
    /// Build the value from a task state read from storage.
    fn from_task_state(state: DagRunTaskState) -> Self;
}

impl CacheValue for DagRunTaskState {
    fn from_task_state(state: DagRunTaskState) -> Self {
        state
    }
}

/// Mutex-guarded map holding at most one value per key.
pub struct StateCache<K: CacheKey, V: CacheValue> {
    data: Mutex<HashMap<K, V>>,
}

impl<K: CacheKey, V: CacheValue> StateCache<K, V> {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<K, V>>, CacheError> {
        self.data.lock().map_err(|_| CacheError::LockPoisoned)
    }

    /// Insert a new entry. Fails if the key is already cached.
    pub fn add(&self, key: K, value: V) -> Result<(), CacheError> {
        let mut data = self.lock()?;
        if data.contains_key(&key) {
            return Err(CacheError::KeyExists(key.to_string()));
        }
        data.insert(key, value);
        Ok(())
    }

    /// Cached value for `key`.
    pub fn get(&self, key: &K) -> Result<V, CacheError> {
        let data = self.lock()?;
        data.get(key)
            .cloned()
            .ok_or_else(|| CacheError::KeyNotFound(key.to_string()))
    }

    /// Drop the entry for `key`, if any.
    pub fn remove(&self, key: &K) -> Result<(), CacheError> {
        self.lock()?.remove(key);
        Ok(())
    }

    /// Replace the value of an existing entry.
    pub fn update(&self, key: K, value: V) -> Result<(), CacheError> {
        let mut data = self.lock()?;
        match data.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(CacheError::KeyNotFound(key.to_string())),
        }
    }

    /// Read the current value for `key` from storage and cache it.
    ///
    /// The entry is inserted or overwritten. If the read or the parsing of
    /// the row fails, the cache is left untouched.
    pub async fn pull_from_database<S>(&self, key: &K, storage: &S) -> Result<V, CacheError>
    where
        S: Storage + ?Sized,
    {
        let value = match key.as_cacheable() {
            CacheableKey::DagRunTask(drt) => {
                let row = storage
                    .read_dag_run_task_status(&drt.dag_id, drt.at_time, &drt.task_id)
                    .await?;
                let status: DagRunTaskStatus = row.status.parse()?;
                let status_updated_at = parse_timestamp(&row.status_updated_at)?;
                V::from_task_state(DagRunTaskState {
                    status,
                    status_updated_at,
                })
            }
            CacheableKey::DagRun(_) => return Err(CacheError::UnsupportedKeyType("DagRun")),
        };

        self.lock()?.insert(key.clone(), value.clone());
        tracing::debug!(key = %key, "Pulled cache entry from storage");
        Ok(value)
    }

    /// Cached value for `key`, pulling it from storage on a miss.
    pub async fn get_or_pull<S>(&self, key: &K, storage: &S) -> Result<V, CacheError>
    where
        S: Storage + ?Sized,
    {
        match self.get(key) {
            Err(CacheError::KeyNotFound(_)) => self.pull_from_database(key, storage).await,
            other => other,
        }
    }

    pub fn len(&self) -> usize {
        self.data
            .lock()
            .map(|data| data.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: CacheKey, V: CacheValue> Default for StateCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
