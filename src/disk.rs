//! Disk Tier
//!
//! Persistent local key-value store backing the cache across repository
//! outages. Keys and values pass through the binary object codec; the
//! engine directory is zstd-compressed and written without per-call fsync,
//! so entries are durable on engine flush rather than on return from
//! `save`. One process-wide mutex serializes every engine operation, and
//! an optional daemon worker periodically wipes and rebuilds the store.

use crate::codec::{CodecError, ObjectCodec};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Engine page-cache budget, in bytes.
const WRITE_CACHE_BYTES: u64 = 1024 * 1024;

/// zstd level for on-disk blocks.
const COMPRESSION_FACTOR: i32 = 10;

/// Engine background flush period, in milliseconds.
const FLUSH_EVERY_MS: u64 = 500;

/// How long `close` waits for an in-flight cleanup before detaching the
/// worker thread.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Disk tier errors
#[derive(Debug, Error)]
pub enum DiskError {
    /// Store directory or engine could not be initialized
    #[error("disk store initialization failed: {0}")]
    Init(String),

    /// Underlying engine failure
    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),

    /// Key or value failed to encode or decode
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Filesystem failure outside the engine
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine lost after a failed wipe-and-rebuild; the next cleanup
    /// retries the rebuild
    #[error("storage engine unavailable after a failed rebuild: {0}")]
    Unavailable(String),

    /// Operation on a closed store
    #[error("disk store is closed")]
    Closed,
}

/// Disk store configuration
#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    /// Directory holding the engine files; created with all parents if
    /// missing. One process owns a given directory at a time.
    pub path: PathBuf,

    /// Reserved. Accepted for API stability; cleanup wipes every entry
    /// regardless of age.
    pub retention_window: Duration,

    /// Period of the full-wipe cleanup worker. Zero disables the worker.
    pub cleanup_interval: Duration,
}

impl Default for DiskStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(crate::DEFAULT_STORE_PATH),
            retention_window: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::ZERO,
        }
    }
}

/// Persistent disk tier over an embedded key-value engine.
///
/// Point and batch operations serialize on one exclusive engine lock.
/// Errors surface to the direct caller; only the tier coordinator's lookup
/// path swallows them.
pub struct DiskStore {
    path: PathBuf,
    retention_window: Duration,
    codec: ObjectCodec,
    engine: Arc<Mutex<EngineState>>,
    cleanup: Mutex<Option<CleanupWorker>>,
    closed: AtomicBool,
}

/// Engine handle lifecycle behind the store lock.
enum EngineState {
    Open(sled::Db),
    /// A wipe-and-rebuild lost the engine; the stored reason surfaces as
    /// [`DiskError::Unavailable`] until a later cleanup reopens it.
    Failed(String),
    Closed,
}

impl EngineState {
    fn db(&self) -> Result<&sled::Db, DiskError> {
        match self {
            EngineState::Open(db) => Ok(db),
            EngineState::Failed(reason) => Err(DiskError::Unavailable(reason.clone())),
            EngineState::Closed => Err(DiskError::Closed),
        }
    }
}

impl DiskStore {
    /// Opens (creating if missing) the store at `config.path` and starts
    /// the cleanup worker when an interval is configured.
    pub fn open(config: DiskStoreConfig) -> Result<Self, DiskError> {
        fs::create_dir_all(&config.path).map_err(|e| {
            DiskError::Init(format!(
                "failed to create store directory {}: {}",
                config.path.display(),
                e
            ))
        })?;
        let db = open_engine(&config.path).map_err(|e| {
            DiskError::Init(format!(
                "failed to open storage engine at {}: {}",
                config.path.display(),
                e
            ))
        })?;
        let engine = Arc::new(Mutex::new(EngineState::Open(db)));

        let cleanup = if config.cleanup_interval > Duration::ZERO {
            Some(spawn_cleanup_worker(
                Arc::clone(&engine),
                config.path.clone(),
                config.cleanup_interval,
            )?)
        } else {
            None
        };

        log::debug!("disk store opened at {}", config.path.display());

        Ok(Self {
            path: config.path,
            retention_window: config.retention_window,
            codec: ObjectCodec::new(),
            engine,
            cleanup: Mutex::new(cleanup),
            closed: AtomicBool::new(false),
        })
    }

    /// Persists one entry. Returns after the engine acknowledges the
    /// write; durability follows on the next engine flush.
    pub fn save<K, V>(&self, key: &K, value: &V) -> Result<(), DiskError>
    where
        K: Serialize,
        V: Serialize,
    {
        let key_bytes = self.codec.encode(key)?;
        let value_bytes = self.codec.encode(value)?;
        let guard = self.engine.lock();
        guard.db()?.insert(key_bytes, value_bytes)?;
        Ok(())
    }

    /// Persists all entries as a single atomic batch: either every entry
    /// lands or none do. An empty slice succeeds.
    pub fn save_batch<K, V>(&self, entries: &[(K, V)]) -> Result<(), DiskError>
    where
        K: Serialize,
        V: Serialize,
    {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(self.codec.encode(key)?, self.codec.encode(value)?);
        }
        let guard = self.engine.lock();
        guard.db()?.apply_batch(batch)?;
        Ok(())
    }

    /// Point lookup. Absent keys return `None`.
    pub fn load<K, V>(&self, key: &K) -> Result<Option<V>, DiskError>
    where
        K: Serialize,
        V: DeserializeOwned,
    {
        let key_bytes = self.codec.encode(key)?;
        let stored = {
            let guard = self.engine.lock();
            guard.db()?.get(key_bytes)?
        };
        match stored {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Multi-key lookup under one lock hold. Absent keys are omitted from
    /// the result; present keys map to their decoded values. An empty key
    /// slice returns an empty map.
    pub fn load_batch<K, V>(&self, keys: &[K]) -> Result<HashMap<K, V>, DiskError>
    where
        K: Serialize + Eq + Hash + Clone,
        V: DeserializeOwned,
    {
        let mut encoded = Vec::with_capacity(keys.len());
        for key in keys {
            encoded.push(self.codec.encode(key)?);
        }

        let mut found = Vec::new();
        {
            let guard = self.engine.lock();
            let db = guard.db()?;
            for (key, key_bytes) in keys.iter().zip(&encoded) {
                if let Some(bytes) = db.get(key_bytes)? {
                    found.push((key.clone(), bytes));
                }
            }
        }

        let mut result = HashMap::with_capacity(found.len());
        for (key, bytes) in found {
            result.insert(key, self.codec.decode(&bytes)?);
        }
        Ok(result)
    }

    /// Wipes every stored entry by destroying and recreating the engine
    /// directory under the engine lock. The store stays usable afterwards;
    /// concurrent operations block for the duration and never observe a
    /// half-destroyed state. If the rebuild itself fails, the error is
    /// surfaced and operations report [`DiskError::Unavailable`] until a
    /// later cleanup brings the engine back.
    pub fn cleanup(&self) -> Result<(), DiskError> {
        let mut guard = self.engine.lock();
        wipe_and_reopen(&mut guard, &self.path)
    }

    /// Forces engine durability for everything written so far.
    pub fn flush(&self) -> Result<(), DiskError> {
        let guard = self.engine.lock();
        guard.db()?.flush()?;
        Ok(())
    }

    /// Stops the cleanup worker, flushes, and releases the engine.
    /// Idempotent; subsequent operations fail with [`DiskError::Closed`].
    pub fn close(&self) -> Result<(), DiskError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(worker) = self.cleanup.lock().take() {
            worker.stop();
        }
        let mut guard = self.engine.lock();
        if let EngineState::Open(db) = std::mem::replace(&mut *guard, EngineState::Closed) {
            db.flush()?;
        }
        log::debug!("disk store at {} closed", self.path.display());
        Ok(())
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured retention window. Reserved: cleanup wipes all entries
    /// regardless of age.
    pub fn retention_window(&self) -> Duration {
        self.retention_window
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("disk store close during drop failed: {}", e);
        }
    }
}

struct CleanupWorker {
    shutdown_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

impl CleanupWorker {
    fn stop(self) {
        let _ = self.shutdown_tx.send(());
        match self.done_rx.recv_timeout(SHUTDOWN_GRACE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "cleanup worker did not stop within {:?}; detaching",
                    SHUTDOWN_GRACE
                );
            }
        }
    }
}

fn spawn_cleanup_worker(
    engine: Arc<Mutex<EngineState>>,
    path: PathBuf,
    interval: Duration,
) -> Result<CleanupWorker, DiskError> {
    let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
    let (done_tx, done_rx) = channel::bounded::<()>(1);
    let handle = thread::Builder::new()
        .name("tiercache-cleanup".to_string())
        .spawn(move || {
            let _done = done_tx;
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let mut guard = engine.lock();
                        if matches!(*guard, EngineState::Closed) {
                            break;
                        }
                        match wipe_and_reopen(&mut guard, &path) {
                            Ok(()) => {
                                log::debug!("periodic cleanup wiped store at {}", path.display());
                            }
                            Err(e) => log::warn!("periodic cleanup failed: {}", e),
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(|e| DiskError::Init(format!("failed to spawn cleanup worker: {}", e)))?;
    Ok(CleanupWorker {
        shutdown_tx,
        done_rx,
        handle,
    })
}

/// Drops the engine handle, destroys the directory, recreates it, and
/// reopens the engine. Reopening is attempted even when the wipe itself
/// failed. A failed rebuild parks the engine in [`EngineState::Failed`]
/// so later operations report the cause instead of looking closed, and
/// the next cleanup retries from there.
fn wipe_and_reopen(engine: &mut EngineState, path: &Path) -> Result<(), DiskError> {
    match std::mem::replace(engine, EngineState::Closed) {
        EngineState::Open(db) => drop(db),
        // An earlier rebuild failed; retry from the bare directory.
        EngineState::Failed(_) => {}
        EngineState::Closed => return Err(DiskError::Closed),
    }

    let wiped = remove_store_dir(path);
    let reopened = fs::create_dir_all(path)
        .map_err(DiskError::Io)
        .and_then(|()| open_engine(path).map_err(DiskError::Engine));
    match reopened {
        Ok(db) => {
            *engine = EngineState::Open(db);
            wiped
        }
        Err(e) => {
            *engine = EngineState::Failed(e.to_string());
            Err(e)
        }
    }
}

fn remove_store_dir(path: &Path) -> Result<(), DiskError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DiskError::Io(e)),
    }
}

fn open_engine(path: &Path) -> Result<sled::Db, sled::Error> {
    sled::Config::new()
        .path(path)
        .cache_capacity(WRITE_CACHE_BYTES)
        .mode(sled::Mode::HighThroughput)
        .use_compression(true)
        .compression_factor(COMPRESSION_FACTOR)
        .flush_every_ms(Some(FLUSH_EVERY_MS))
        .open()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_at(path: &Path) -> DiskStore {
        DiskStore::open(DiskStoreConfig {
            path: path.to_path_buf(),
            ..DiskStoreConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        store.save(&"k".to_string(), &"v".to_string()).unwrap();
        assert_eq!(
            store.load::<String, String>(&"k".to_string()).unwrap(),
            Some("v".to_string())
        );
        assert_eq!(
            store.load::<String, String>(&"missing".to_string()).unwrap(),
            None
        );
    }

    #[test]
    fn manual_cleanup_leaves_store_usable() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        store.save(&1u64, &"one".to_string()).unwrap();
        store.cleanup().unwrap();
        assert_eq!(store.load::<u64, String>(&1u64).unwrap(), None);
        store.save(&2u64, &"two".to_string()).unwrap();
        assert_eq!(
            store.load::<u64, String>(&2u64).unwrap(),
            Some("two".to_string())
        );
    }

    #[test]
    fn closed_store_rejects_operations() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.save(&"k".to_string(), &"v".to_string()),
            Err(DiskError::Closed)
        ));
        assert!(matches!(
            store.load::<String, String>(&"k".to_string()),
            Err(DiskError::Closed)
        ));
        assert!(matches!(store.cleanup(), Err(DiskError::Closed)));
    }

    #[test]
    fn engine_states_map_to_distinct_errors() {
        let failed = EngineState::Failed("rebuild failed".to_string());
        assert!(matches!(failed.db(), Err(DiskError::Unavailable(_))));

        let closed = EngineState::Closed;
        assert!(matches!(closed.db(), Err(DiskError::Closed)));
    }

    #[test]
    fn failed_engine_recovers_on_next_cleanup() {
        let dir = tempdir().unwrap();
        let mut state = EngineState::Failed("earlier rebuild failed".to_string());
        wipe_and_reopen(&mut state, dir.path()).unwrap();
        assert!(matches!(state, EngineState::Open(_)));
    }
}
