//! The cache tier manager: the full `Get`/`Set`/`Delete`/`Clear`/`Stats`/
//! `EnforceMaxSize` operation set over one in-process tier and a storage
//! backend's freshness ledger.
//!
//! Entries carry their own TTL set at write time (per §4.2.4's per-data-type
//! defaults, overridable per call), so expiry is tracked per entry here
//! rather than delegated to `moka`'s uniform `time_to_live`. That per-entry
//! tracking is also what makes [`Sweepable::sweep_expired`] possible: an
//! eager walk over every entry's `expires_at`, driven by the background
//! maintenance loop, rather than relying on `moka`'s own lazy
//! expire-on-access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cache_core::error::Result;
use cache_core::health::PerformanceSnapshot;
use cache_core::storage::StorageBackend;
use cache_core::types::DataType;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use tokio::sync::Mutex;
use tracing::instrument;

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Where a [`CacheTierManager::get`] call was answered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Served from the in-process tier without falling through.
    Memory,
    /// The in-process tier missed (or had expired), but the persistent
    /// tier's freshness ledger says the key is still valid.
    ///
    /// Per the freshness-ledger resolution, the persistent tier is not a
    /// value store: a `Persistent` outcome is a signal that the caller's
    /// own reconstruction path (reading the entity tables) can be trusted
    /// without going further upstream, not a value to return directly.
    Persistent,
    /// Not found, or expired, in either tier.
    Miss,
}

/// Implements the cache tier's `Get`/`Set`/`Delete`/`Clear`/`Stats`/
/// `EnforceMaxSize` operation set, and the three-tier read path: an
/// in-process hit short-circuits; an in-process miss or expiry consults the
/// storage backend's freshness ledger before reporting a full miss.
#[derive(Clone, Debug)]
pub struct CacheTierManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    entries: Cache<String, Entry<V>>,
    storage: Arc<dyn StorageBackend>,
    recency: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl<V> CacheTierManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Builds a manager bounded at `max_capacity` in-process entries, backed
    /// by `storage`'s freshness ledger on a local miss.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_capacity).build(),
            storage,
            recency: Arc::new(Mutex::new(HashMap::new())),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs the three-tier read path.
    ///
    /// An unexpired in-process entry is returned directly. An expired one
    /// is evicted (counted) and treated as a miss. Either kind of local miss
    /// then consults [`StorageBackend::is_cache_valid`]: a valid ledger
    /// entry is reported as [`ReadOutcome::Persistent`] with no value (the
    /// caller reconstructs it from the entity tables and repopulates via
    /// [`Self::set`]); an invalid or errored lookup is a full
    /// [`ReadOutcome::Miss`].
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &str) -> (Option<V>, ReadOutcome) {
        if let Some(entry) = self.entries.get(key).await {
            if entry.expires_at > Utc::now() {
                self.recency.lock().await.insert(key.to_string(), Utc::now());
                self.hits.fetch_add(1, Ordering::Relaxed);
                return (Some(entry.value), ReadOutcome::Memory);
            }
            self.evict(key).await;
        }

        match self.storage.is_cache_valid(key).await {
            Ok(true) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                (None, ReadOutcome::Persistent)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                (None, ReadOutcome::Miss)
            }
        }
    }

    /// Writes `value` into the in-process tier with `expires_at = now + ttl`
    /// and refreshes `key`'s entry in the storage backend's freshness
    /// ledger.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn set(&self, key: &str, value: V, ttl: Duration, data_type: DataType) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.entries
            .insert(key.to_string(), Entry { value, expires_at })
            .await;
        self.recency.lock().await.insert(key.to_string(), Utc::now());
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.touch_cache(key, data_type, ttl).await
    }

    /// Removes `key` from the in-process tier and the storage backend's
    /// freshness ledger.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key).await;
        self.recency.lock().await.remove(key);
        self.storage.delete_cache_entry(key).await
    }

    /// Empties the in-process tier and truncates the storage backend's
    /// freshness ledger.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        self.recency.lock().await.clear();
        self.storage.clear_cache_metadata().await
    }

    /// Rolling hit/miss/write/eviction counters for this manager.
    #[must_use]
    pub fn stats(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            coalesced: 0,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evicts entries in ascending last-accessed order until at most `n`
    /// remain, incrementing the eviction counter once per entry removed.
    ///
    /// Returns the number of entries evicted.
    #[instrument(skip(self))]
    pub async fn enforce_max_size(&self, n: usize) -> usize {
        let mut recency = self.recency.lock().await;
        if recency.len() <= n {
            return 0;
        }
        let mut ordered: Vec<(String, DateTime<Utc>)> =
            recency.iter().map(|(k, t)| (k.clone(), *t)).collect();
        ordered.sort_by_key(|(_, accessed_at)| *accessed_at);

        let overflow = ordered.len() - n;
        for (key, _) in ordered.into_iter().take(overflow) {
            self.entries.invalidate(&key).await;
            recency.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        overflow
    }

    async fn evict(&self, key: &str) {
        self.entries.invalidate(key).await;
        self.recency.lock().await.remove(key);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

/// The handle background maintenance drives to eagerly reap an in-process
/// tier, without needing to know the cached value type.
#[async_trait]
pub trait Sweepable: std::fmt::Debug + Send + Sync {
    /// Drops every entry whose TTL has already elapsed and returns how many
    /// were removed.
    async fn sweep_expired(&self) -> usize;
}

#[async_trait]
impl<V> Sweepable for CacheTierManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Eagerly drops every in-process entry whose `expires_at` has already
    /// passed, rather than waiting for the next access to notice it.
    ///
    /// Per §4.2.3, time-based eviction happens both lazily on access and
    /// eagerly from the background maintenance loop; this is the latter.
    #[instrument(skip(self))]
    async fn sweep_expired(&self) -> usize {
        // `iter()` reflects pending inserts eventually, not necessarily
        // immediately; force them through first so a just-inserted entry
        // isn't invisible to this walk.
        self.entries.run_pending_tasks().await;

        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.as_str().to_string())
            .collect();

        for key in &expired {
            self.evict(key).await;
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_storage::InMemoryBackend;

    fn manager(max_capacity: u64) -> CacheTierManager<u32> {
        CacheTierManager::new(Arc::new(InMemoryBackend::new()), max_capacity)
    }

    #[tokio::test]
    async fn miss_on_empty_manager() {
        let tier = manager(10);
        let (value, outcome) = tier.get("k").await;
        assert_eq!(value, None);
        assert_eq!(outcome, ReadOutcome::Miss);
        assert_eq!(tier.stats().misses, 1);
    }

    #[tokio::test]
    async fn set_then_get_is_a_memory_hit() {
        let tier = manager(10);
        tier.set("k", 7, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        let (value, outcome) = tier.get("k").await;
        assert_eq!(value, Some(7));
        assert_eq!(outcome, ReadOutcome::Memory);
        assert_eq!(tier.stats().hits, 1);
        assert_eq!(tier.stats().writes, 1);
    }

    #[tokio::test]
    async fn expired_entry_falls_through_to_persistent_ledger() {
        let tier = manager(10);
        tier.set("k", 7, Duration::from_millis(10), DataType::Analysis)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (value, outcome) = tier.get("k").await;
        assert_eq!(value, None);
        assert_eq!(outcome, ReadOutcome::Persistent);
        assert_eq!(tier.stats().evictions, 1);
    }

    #[tokio::test]
    async fn expired_entry_with_reaped_ledger_is_a_full_miss() {
        let storage = Arc::new(InMemoryBackend::new());
        storage
            .touch_cache("k", DataType::Analysis, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.reap_expired_cache().await.unwrap();

        let tier: CacheTierManager<u32> = CacheTierManager::new(storage, 10);
        let (value, outcome) = tier.get("k").await;
        assert_eq!(value, None);
        assert_eq!(outcome, ReadOutcome::Miss);
    }

    #[tokio::test]
    async fn delete_removes_entry_and_ledger_row() {
        let tier = manager(10);
        tier.set("k", 1, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        tier.delete("k").await.unwrap();
        let (value, outcome) = tier.get("k").await;
        assert_eq!(value, None);
        assert_eq!(outcome, ReadOutcome::Miss);
    }

    #[tokio::test]
    async fn clear_empties_every_entry() {
        let tier = manager(10);
        tier.set("a", 1, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        tier.set("b", 2, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        tier.clear().await.unwrap();
        assert_eq!(tier.get("a").await.0, None);
        assert_eq!(tier.get("b").await.0, None);
    }

    #[tokio::test]
    async fn enforce_max_size_evicts_least_recently_used() {
        let tier = manager(100);
        tier.set("a", 1, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        tier.set("b", 2, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        tier.set("c", 3, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        // Touch "b" and "c" so "a" is the least recently used.
        let _ = tier.get("b").await;
        let _ = tier.get("c").await;

        let evicted = tier.enforce_max_size(2).await;
        assert_eq!(evicted, 1);
        assert_eq!(tier.get("a").await.1, ReadOutcome::Miss);
        assert_eq!(tier.get("b").await.1, ReadOutcome::Memory);
        assert_eq!(tier.get("c").await.1, ReadOutcome::Memory);
        assert_eq!(tier.stats().evictions, 1);
    }

    #[tokio::test]
    async fn enforce_max_size_is_a_no_op_under_the_limit() {
        let tier = manager(100);
        tier.set("a", 1, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        assert_eq!(tier.enforce_max_size(10).await, 0);
    }

    #[tokio::test]
    async fn sweep_expired_eagerly_drops_stale_entries_without_an_access() {
        let tier = manager(100);
        tier.set("stale", 1, Duration::from_millis(10), DataType::Analysis)
            .await
            .unwrap();
        tier.set("fresh", 2, Duration::from_secs(60), DataType::Analysis)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let swept = Sweepable::sweep_expired(&tier).await;
        assert_eq!(swept, 1);
        assert_eq!(tier.stats().evictions, 1);

        // The stale entry is gone from the in-process tier without this
        // call having touched it first (no lazy eviction-on-access needed);
        // the fresh one is untouched.
        assert_eq!(tier.get("fresh").await.1, ReadOutcome::Memory);
    }
}
