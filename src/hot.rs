//! Hot Tier
//!
//! Bounded in-memory tier over a TinyLFU cache: size-driven eviction,
//! write-age expiry, and an eviction sink that observes every departure.
//! Reads do not block each other; the size bound is approximate while
//! maintenance is pending.

use moka::notification::RemovalCause;
use moka::sync::{Cache, CacheBuilder};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Why an entry left the hot tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// Capacity pressure
    Size,
    /// Entry outlived the write-age bound
    Expired,
    /// Explicit invalidation
    Explicit,
    /// Overwritten by a newer value for the same key
    Replaced,
}

impl From<RemovalCause> for EvictionCause {
    fn from(cause: RemovalCause) -> Self {
        match cause {
            RemovalCause::Size => EvictionCause::Size,
            RemovalCause::Expired => EvictionCause::Expired,
            RemovalCause::Explicit => EvictionCause::Explicit,
            RemovalCause::Replaced => EvictionCause::Replaced,
        }
    }
}

/// Sink handed every `(key, value, cause)` departure from the hot tier.
pub type EvictionSink<K, V> = Arc<dyn Fn(K, V, EvictionCause) + Send + Sync>;

/// Bounded in-memory cache tier with write-age expiry.
pub struct HotTier<K, V> {
    cache: Cache<K, V>,
}

impl<K, V> HotTier<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a tier bounded by `max_size` entries, expiring entries
    /// `ttl` after their last write.
    pub fn new(max_size: u64, ttl: Duration) -> Self {
        Self {
            cache: cache_builder(max_size, ttl).build(),
        }
    }

    /// Creates a tier whose departures are handed to `sink`.
    ///
    /// The sink runs for every cause and observes the pair after the entry
    /// is already gone from the tier. It must not panic; failures belong
    /// inside the sink.
    pub fn with_eviction_sink(max_size: u64, ttl: Duration, sink: EvictionSink<K, V>) -> Self {
        let cache = cache_builder(max_size, ttl)
            .eviction_listener(move |key: Arc<K>, value: V, cause: RemovalCause| {
                sink(key.as_ref().clone(), value, cause.into());
            })
            .build();
        Self { cache }
    }

    /// Returns the live value for `key`, if any. Expired entries are not
    /// returned even before maintenance removes them.
    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    /// Inserts or replaces the entry for `key`, resetting its write age.
    pub fn insert(&self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    /// Removes the entry for `key`; the departure reaches the sink with
    /// [`EvictionCause::Explicit`].
    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Number of entries currently held, including those awaiting
    /// maintenance.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Applies pending maintenance: size evictions, expiries, and sink
    /// deliveries quiesce before this returns.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}

fn cache_builder<K, V>(max_size: u64, ttl: Duration) -> CacheBuilder<K, V, Cache<K, V>>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder().max_capacity(max_size).time_to_live(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Departures = Arc<Mutex<Vec<(String, String, EvictionCause)>>>;

    fn collecting_sink() -> (Departures, EvictionSink<String, String>) {
        let departures: Departures = Arc::new(Mutex::new(Vec::new()));
        let sink_departures = Arc::clone(&departures);
        let sink: EvictionSink<String, String> = Arc::new(move |key, value, cause| {
            sink_departures.lock().push((key, value, cause));
        });
        (departures, sink)
    }

    #[test]
    fn insert_then_get() {
        let tier: HotTier<String, String> = HotTier::new(16, Duration::from_secs(60));
        tier.insert("k".to_string(), "v".to_string());
        assert_eq!(tier.get(&"k".to_string()), Some("v".to_string()));
        assert_eq!(tier.get(&"missing".to_string()), None);
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let tier: HotTier<String, String> = HotTier::new(16, Duration::from_millis(50));
        tier.insert("k".to_string(), "v".to_string());
        assert_eq!(tier.get(&"k".to_string()), Some("v".to_string()));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(tier.get(&"k".to_string()), None);
    }

    #[test]
    fn capacity_is_bounded_after_maintenance() {
        let tier: HotTier<u32, u32> = HotTier::new(8, Duration::from_secs(60));
        for i in 0..256 {
            tier.insert(i, i);
        }
        tier.run_pending_tasks();
        assert!(tier.entry_count() <= 8);
    }

    #[test]
    fn sink_observes_explicit_invalidation() {
        let (departures, sink) = collecting_sink();
        let tier = HotTier::with_eviction_sink(16, Duration::from_secs(60), sink);
        tier.insert("k".to_string(), "v".to_string());
        tier.invalidate(&"k".to_string());
        tier.run_pending_tasks();

        let seen = departures.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "k");
        assert_eq!(seen[0].1, "v");
        assert_eq!(seen[0].2, EvictionCause::Explicit);
    }

    #[test]
    fn sink_observes_size_eviction() {
        let (departures, sink) = collecting_sink();
        let tier = HotTier::with_eviction_sink(1, Duration::from_secs(60), sink);
        tier.insert("k1".to_string(), "v1".to_string());
        tier.insert("k2".to_string(), "v2".to_string());
        tier.run_pending_tasks();

        let seen = departures.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2, EvictionCause::Size);
        assert!(seen[0].0 == "k1" || seen[0].0 == "k2");
    }

    #[test]
    fn filtering_sink_drops_replacements() {
        // A sink shaped like the coordinator's spillover sink: replaced
        // values never reach it.
        let departures: Departures = Arc::new(Mutex::new(Vec::new()));
        let sink_departures = Arc::clone(&departures);
        let sink: EvictionSink<String, String> = Arc::new(move |key, value, cause| {
            if cause == EvictionCause::Replaced {
                return;
            }
            sink_departures.lock().push((key, value, cause));
        });
        let tier = HotTier::with_eviction_sink(16, Duration::from_secs(60), sink);

        tier.insert("k".to_string(), "old".to_string());
        tier.insert("k".to_string(), "new".to_string());
        tier.run_pending_tasks();
        assert!(departures.lock().is_empty());

        tier.invalidate(&"k".to_string());
        tier.run_pending_tasks();
        let seen = departures.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "new");
        assert_eq!(seen[0].2, EvictionCause::Explicit);
    }
}
