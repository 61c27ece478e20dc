//! Tier Coordinator
//!
//! Public entry point over the three tiers. Lookups resolve hot tier →
//! repository → disk tier, promoting whatever they recover back into the
//! hot tier; writes land in the hot tier only and reach the disk tier when
//! the hot tier evicts them. Repository and disk failures inside `get` are
//! logged and treated as absent, so an outage degrades a lookup to the
//! surviving tiers instead of failing it.

use crate::disk::{DiskError, DiskStore, DiskStoreConfig};
use crate::hot::{EvictionCause, EvictionSink, HotTier};
use crate::repository::{InMemoryRepository, Repository};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Default hot-tier capacity.
const DEFAULT_MAX_CACHE_SIZE: u64 = 1000;

/// Default disk retention, in days. Reserved; see
/// [`DiskStoreConfig::retention_window`].
const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Default write-age expiry for hot-tier entries.
const DEFAULT_HOT_TIER_TTL: Duration = Duration::from_secs(15 * 60);

/// How long `close` waits for the spillover worker to drain before
/// detaching it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Construction failed
    #[error("cache initialization failed: {0}")]
    Init(String),

    /// Disk tier failure surfaced outside the lookup path
    #[error("disk tier error: {0}")]
    Disk(#[from] DiskError),

    /// Operation on a closed coordinator
    #[error("cache is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct TierCounters {
    hot_hits: AtomicU64,
    repository_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

/// Snapshot of per-tier lookup accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Lookups answered by the hot tier
    pub hot_hits: u64,
    /// Lookups answered by the repository
    pub repository_hits: u64,
    /// Lookups answered by the disk tier
    pub disk_hits: u64,
    /// Lookups answered by no tier
    pub misses: u64,
}

impl TierStats {
    /// Fraction of lookups answered by any tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hot_hits + self.repository_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

enum SpillMessage<K, V> {
    Entry(K, V),
    Shutdown,
}

struct SpillWorker<K, V> {
    tx: Sender<SpillMessage<K, V>>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

impl<K, V> SpillWorker<K, V> {
    fn stop(self) {
        let _ = self.tx.send(SpillMessage::Shutdown);
        match self.done_rx.recv_timeout(SHUTDOWN_GRACE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "spillover worker did not drain within {:?}; detaching",
                    SHUTDOWN_GRACE
                );
            }
        }
    }
}

fn spawn_spill_worker<K, V>(disk: Arc<DiskStore>) -> Result<SpillWorker<K, V>, CacheError>
where
    K: Serialize + Send + 'static,
    V: Serialize + Send + 'static,
{
    let (tx, rx) = channel::unbounded::<SpillMessage<K, V>>();
    let (done_tx, done_rx) = channel::bounded::<()>(1);
    let handle = thread::Builder::new()
        .name("tiercache-spillover".to_string())
        .spawn(move || {
            let _done = done_tx;
            while let Ok(message) = rx.recv() {
                match message {
                    SpillMessage::Entry(key, value) => {
                        if let Err(e) = disk.save(&key, &value) {
                            log::warn!("failed to spill evicted entry to disk: {}", e);
                        }
                    }
                    SpillMessage::Shutdown => break,
                }
            }
        })
        .map_err(|e| CacheError::Init(format!("failed to spawn spillover worker: {}", e)))?;
    Ok(SpillWorker { tx, done_rx, handle })
}

/// Builder for [`TierCoordinator`].
pub struct TierCoordinatorBuilder<K, V> {
    store_path: PathBuf,
    max_cache_size: u64,
    retention_days: u64,
    cleanup_interval: Duration,
    hot_tier_ttl: Duration,
    repository: Option<Arc<dyn Repository<K, V>>>,
    disk_store: Option<DiskStore>,
}

impl<K, V> TierCoordinatorBuilder<K, V> {
    /// Creates a builder with the default options.
    pub fn new() -> Self {
        Self {
            store_path: PathBuf::from(crate::DEFAULT_STORE_PATH),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            retention_days: DEFAULT_RETENTION_DAYS,
            cleanup_interval: Duration::ZERO,
            hot_tier_ttl: DEFAULT_HOT_TIER_TTL,
            repository: None,
            disk_store: None,
        }
    }

    /// Directory for the disk tier database.
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Hot-tier capacity, in entries.
    pub fn max_cache_size(mut self, size: u64) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Disk retention, in days. Accepted for API stability; does not drive
    /// per-entry expiry.
    pub fn retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    /// Period of the disk tier's full-wipe cleanup worker. Zero (the
    /// default) disables it.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Write-age expiry for hot-tier entries.
    pub fn hot_tier_ttl(mut self, ttl: Duration) -> Self {
        self.hot_tier_ttl = ttl;
        self
    }

    /// Authoritative repository to front. The caller keeps ownership; the
    /// coordinator will not close a supplied repository.
    pub fn repository(mut self, repository: Arc<dyn Repository<K, V>>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Pre-built disk tier, exclusively owned by the coordinator from here
    /// on. Overrides `store_path`, `retention_days`, and
    /// `cleanup_interval`.
    pub fn disk_store(mut self, store: DiskStore) -> Self {
        self.disk_store = Some(store);
        self
    }
}

impl<K, V> TierCoordinatorBuilder<K, V>
where
    K: Hash + Eq + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Builds a live coordinator, opening the disk tier and starting the
    /// spillover worker.
    pub fn build(self) -> Result<TierCoordinator<K, V>, CacheError> {
        let disk = match self.disk_store {
            Some(store) => store,
            None => DiskStore::open(DiskStoreConfig {
                path: self.store_path,
                retention_window: Duration::from_secs(self.retention_days * 24 * 60 * 60),
                cleanup_interval: self.cleanup_interval,
            })
            .map_err(|e| CacheError::Init(e.to_string()))?,
        };
        let disk = Arc::new(disk);

        let (repository, owns_repository) = match self.repository {
            Some(repository) => (repository, false),
            None => (
                Arc::new(InMemoryRepository::new()) as Arc<dyn Repository<K, V>>,
                true,
            ),
        };

        let spill = spawn_spill_worker::<K, V>(Arc::clone(&disk))?;
        let spill_tx = spill.tx.clone();
        let sink: EvictionSink<K, V> = Arc::new(move |key, value, cause| {
            // A replaced value is superseded; only live departures spill.
            if cause == EvictionCause::Replaced {
                return;
            }
            let _ = spill_tx.send(SpillMessage::Entry(key, value));
        });
        let hot = HotTier::with_eviction_sink(self.max_cache_size, self.hot_tier_ttl, sink);

        Ok(TierCoordinator {
            hot,
            repository,
            owns_repository,
            disk,
            spill: Mutex::new(Some(spill)),
            closed: AtomicBool::new(false),
            counters: TierCounters::default(),
        })
    }
}

impl<K, V> Default for TierCoordinatorBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-through cache over a hot in-memory tier, an authoritative
/// repository, and a persistent disk tier.
///
/// The coordinator exclusively owns its disk tier and shares the
/// repository with the caller. Entries evicted from the hot tier are
/// spilled to the disk tier on a background worker, so a later lookup can
/// recover them while the repository is down.
pub struct TierCoordinator<K, V>
where
    K: Hash + Eq + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    hot: HotTier<K, V>,
    repository: Arc<dyn Repository<K, V>>,
    owns_repository: bool,
    disk: Arc<DiskStore>,
    spill: Mutex<Option<SpillWorker<K, V>>>,
    closed: AtomicBool,
    counters: TierCounters,
}

impl<K, V> TierCoordinator<K, V>
where
    K: Hash + Eq + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Starts a builder with the default options.
    pub fn builder() -> TierCoordinatorBuilder<K, V> {
        TierCoordinatorBuilder::new()
    }

    /// Looks up `key` across the tiers: hot tier, then repository, then
    /// disk tier; the first tier holding the key wins. A repository miss
    /// still falls through to the disk tier. Values recovered from the
    /// repository or the disk tier are promoted into the hot tier before
    /// being returned. Repository and disk failures are logged and treated
    /// as absent.
    pub fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.ensure_open()?;

        if let Some(value) = self.hot.get(key) {
            self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        match self.repository.find(key) {
            Ok(Some(value)) => {
                self.counters.repository_hits.fetch_add(1, Ordering::Relaxed);
                self.hot.insert(key.clone(), value.clone());
                return Ok(Some(value));
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("repository lookup failed, falling back to disk tier: {}", e);
            }
        }

        match self.disk.load::<K, V>(key) {
            Ok(Some(value)) => {
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                self.hot.insert(key.clone(), value.clone());
                Ok(Some(value))
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                log::warn!("disk tier lookup failed: {}", e);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Inserts into the hot tier only. The disk tier receives the entry
    /// if and when the hot tier evicts it; nothing is written through to
    /// the repository. Overwriting a key drops the superseded value
    /// rather than spilling it.
    pub fn put(&self, key: K, value: V) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.hot.insert(key, value);
        Ok(())
    }

    /// Removes `key` from the hot tier. The departed entry still flows
    /// through the eviction sink and is spilled to the disk tier.
    pub fn invalidate(&self, key: &K) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.hot.invalidate(key);
        Ok(())
    }

    /// Runs pending hot-tier maintenance so evictions and expiries are
    /// handed to the spillover worker promptly.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.hot.run_pending_tasks();
        Ok(())
    }

    /// Lookup accounting snapshot.
    pub fn stats(&self) -> TierStats {
        TierStats {
            hot_hits: self.counters.hot_hits.load(Ordering::Relaxed),
            repository_hits: self.counters.repository_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    /// The owned disk tier. Direct operations on it surface their own
    /// errors, unlike lookups through [`get`](Self::get).
    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    /// Flushes hot-tier maintenance, drains the spillover worker, closes
    /// the repository when this coordinator owns it, then closes the disk
    /// tier. Idempotent; later operations fail with
    /// [`CacheError::Closed`].
    pub fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.hot.run_pending_tasks();
        if let Some(worker) = self.spill.lock().take() {
            worker.stop();
        }
        if self.owns_repository {
            if let Err(e) = self.repository.close() {
                log::warn!("repository close failed: {}", e);
            }
        }
        self.disk.close()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<K, V> Drop for TierCoordinator<K, V>
where
    K: Hash + Eq + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("coordinator close during drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hit_rate_handles_empty_and_mixed_counts() {
        let stats = TierStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        let stats = TierStats {
            hot_hits: 6,
            repository_hits: 2,
            disk_hits: 1,
            misses: 1,
        };
        assert!((stats.hit_rate() - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn put_then_get_hits_hot_tier() {
        let dir = tempdir().unwrap();
        let cache: TierCoordinator<String, String> = TierCoordinator::builder()
            .store_path(dir.path())
            .build()
            .unwrap();

        cache.put("k".to_string(), "v".to_string()).unwrap();
        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some("v".to_string()));
        assert_eq!(cache.stats().hot_hits, 1);
        cache.close().unwrap();
    }

    #[test]
    fn absent_everywhere_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache: TierCoordinator<String, String> = TierCoordinator::builder()
            .store_path(dir.path())
            .build()
            .unwrap();

        assert_eq!(cache.get(&"nope".to_string()).unwrap(), None);
        assert_eq!(cache.stats().misses, 1);
        cache.close().unwrap();
    }
}
