//! Repository Contract
//!
//! The authoritative data source the cache fronts. The coordinator only
//! consumes `find` and treats every `find` failure as "absent, repository
//! unavailable", falling through to the disk tier. `save` exists for
//! callers wiring up their own write path; the coordinator never calls it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Backing store is unreachable
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// Backing store failed while handling the call
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Authoritative store consumed by the tier coordinator.
pub trait Repository<K, V>: Send + Sync {
    /// Looks up a value by key. May fail with any error; callers deciding
    /// availability treat every failure the same way.
    fn find(&self, key: &K) -> Result<Option<V>, RepositoryError>;

    /// Persists a value under a key.
    fn save(&self, key: K, value: V) -> Result<(), RepositoryError>;

    /// Releases backing resources. Default: nothing to release.
    fn close(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// In-memory repository: the builder default and a controllable stand-in
/// for an external store in tests and demos.
///
/// Availability can be toggled to simulate an outage, `find` latency can be
/// simulated, and `find` invocations are counted for read-through
/// assertions.
pub struct InMemoryRepository<K, V> {
    entries: RwLock<HashMap<K, V>>,
    available: AtomicBool,
    find_latency: Option<Duration>,
    find_calls: AtomicU64,
}

impl<K, V> InMemoryRepository<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Creates an empty, available repository.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            find_latency: None,
            find_calls: AtomicU64::new(0),
        }
    }

    /// Creates a repository whose `find` sleeps for `latency` before
    /// answering, approximating a slow remote store.
    pub fn with_find_latency(latency: Duration) -> Self {
        Self {
            find_latency: Some(latency),
            ..Self::new()
        }
    }

    /// Marks the repository available or unavailable. While unavailable,
    /// every `find` fails with [`RepositoryError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Whether the repository currently answers `find`.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Number of `find` invocations received so far, including those that
    /// failed while unavailable.
    pub fn find_calls(&self) -> u64 {
        self.find_calls.load(Ordering::Relaxed)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the repository holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, V> Default for InMemoryRepository<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Repository<K, V> for InMemoryRepository<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn find(&self, key: &K) -> Result<Option<V>, RepositoryError> {
        self.find_calls.fetch_add(1, Ordering::Relaxed);
        if !self.is_available() {
            return Err(RepositoryError::Unavailable(
                "repository marked unavailable".to_string(),
            ));
        }
        if let Some(latency) = self.find_latency {
            std::thread::sleep(latency);
        }
        Ok(self.entries.read().get(key).cloned())
    }

    fn save(&self, key: K, value: V) -> Result<(), RepositoryError> {
        self.entries.write().insert(key, value);
        Ok(())
    }
}
