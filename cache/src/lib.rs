//! Shared result cache for Keystone.
//!
//! Results (successes and failures alike) are cached per [`CacheKey`] with
//! a timestamp and the schema version of the build that wrote them:
//!
//! - an entry is valid while `age < cache_time`; expired entries are removed on lookup
//! - a valid entry is stale once `stale_time > 0` and `age > stale_time`
//! - the first access in a store's lifetime purges entries from other schema versions
//! - every [`PRUNE_INTERVAL`] writes, entries older than the longest `cache_time`
//!   seen on lookup are dropped, so keys that are never read again do not pile up
//!
//! Writes are last-write-wins per key.

mod focus;
mod store;

use std::any::{Any, type_name};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;

use keystone_config::CacheConfig;
use keystone_types::{CacheKey, Failure};

pub use focus::FocusSignal;
pub use store::{MemoryStore, ResultStore, StoredEntry};

/// Current shape version of cached values. Bump when a cached type changes
/// incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// Writes between two opportunistic prunes.
pub const PRUNE_INTERVAL: usize = 64;

/// Lifetime rules applied on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub cache_time: Duration,
    /// Zero disables staleness.
    pub stale_time: Duration,
    pub refetch_on_focus: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_millis(CacheConfig::DEFAULT_CACHE_TIME_MS),
            stale_time: Duration::from_millis(CacheConfig::DEFAULT_STALE_TIME_MS),
            refetch_on_focus: false,
        }
    }
}

impl CachePolicy {
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            cache_time: config.cache_time(),
            stale_time: config.stale_time(),
            refetch_on_focus: config.refetch_on_focus,
        }
    }

    #[must_use]
    pub fn is_valid(&self, age: Duration) -> bool {
        age < self.cache_time
    }

    #[must_use]
    pub fn is_stale(&self, age: Duration) -> bool {
        !self.stale_time.is_zero() && age > self.stale_time
    }
}

/// A typed view of a valid cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub result: Result<T, Failure>,
    pub timestamp: Instant,
    pub is_stale: bool,
    pub schema_version: u32,
}

impl<T> CacheEntry<T> {
    #[must_use]
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Process-wide keyed store of `Result<T, Failure>` snapshots.
pub struct ResultCache {
    store: Arc<dyn ResultStore>,
    schema_version: u32,
    swept: OnceLock<usize>,
    /// Longest `cache_time` (ms) any lookup has used. Zero until the first lookup.
    retention_ms: AtomicU64,
    writes: AtomicUsize,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("schema_version", &self.schema_version)
            .field("entries", &self.store.len())
            .field("swept", &self.swept.get().is_some())
            .field("retention_ms", &self.retention_ms.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    /// An empty in-memory cache at the current [`SCHEMA_VERSION`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), SCHEMA_VERSION)
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn ResultStore>, schema_version: u32) -> Self {
        Self {
            store,
            schema_version,
            swept: OnceLock::new(),
            retention_ms: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// The cache shared by every caller in this process.
    pub fn global() -> Arc<ResultCache> {
        static GLOBAL: OnceLock<Arc<ResultCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ResultCache::new())))
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Look up a valid entry. Expired entries are removed; an entry written
    /// with a different `T` is treated as a miss.
    pub fn get<T>(&self, key: &CacheKey, policy: &CachePolicy) -> Option<CacheEntry<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.ensure_swept();
        let cache_ms = u64::try_from(policy.cache_time.as_millis()).unwrap_or(u64::MAX);
        self.retention_ms.fetch_max(cache_ms, Ordering::Relaxed);

        let entry = self.store.load(key)?;
        let age = entry.timestamp.elapsed();

        if !policy.is_valid(age) {
            let written_at = entry.timestamp;
            // Only drop the entry we judged; a concurrent write may have replaced it.
            self.store
                .remove_if(key, &|current| current.timestamp == written_at);
            tracing::debug!(key = %key, age_ms = age.as_millis(), "Cache entry expired");
            return None;
        }

        let Some(result) = entry.value.downcast_ref::<Result<T, Failure>>() else {
            tracing::warn!(
                key = %key,
                expected = type_name::<T>(),
                "Cache entry holds a different type; ignoring"
            );
            return None;
        };

        Some(CacheEntry {
            result: result.clone(),
            timestamp: entry.timestamp,
            is_stale: policy.is_stale(age),
            schema_version: entry.schema_version,
        })
    }

    /// Record a completion, replacing any previous entry for `key`.
    pub fn set<T>(&self, key: CacheKey, result: Result<T, Failure>)
    where
        T: Send + Sync + 'static,
    {
        self.ensure_swept();
        self.store.store(
            key,
            StoredEntry {
                value: Arc::new(result),
                timestamp: Instant::now(),
                schema_version: self.schema_version,
            },
        );

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        let retention = self.retention_ms.load(Ordering::Relaxed);
        if writes.is_multiple_of(PRUNE_INTERVAL) && retention > 0 {
            let pruned = self.prune_older_than(Duration::from_millis(retention));
            if pruned > 0 {
                tracing::debug!(pruned, retention_ms = retention, "Pruned expired cache entries");
            }
        }
    }

    /// Drop every entry at least `max_age` old. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        self.ensure_swept();
        self.store
            .retain(&|_, entry| entry.timestamp.elapsed() < max_age)
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.ensure_swept();
        self.store.remove(key)
    }

    pub fn clear(&self) {
        self.ensure_swept();
        self.store.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Seed an entry carried over from elsewhere (e.g. a previous deployment)
    /// with its original age and schema version.
    ///
    /// Does not count as an access: hydrated entries are subject to the
    /// schema sweep that runs on the first real access.
    pub fn hydrate<T>(
        &self,
        key: CacheKey,
        result: Result<T, Failure>,
        age: Duration,
        schema_version: u32,
    ) where
        T: Send + Sync + 'static,
    {
        let now = Instant::now();
        let value: Arc<dyn Any + Send + Sync> = Arc::new(result);
        self.store.store(
            key,
            StoredEntry {
                value,
                timestamp: now.checked_sub(age).unwrap_or(now),
                schema_version,
            },
        );
    }

    /// Number of entries the schema sweep removed, once it has run.
    #[must_use]
    pub fn purged_on_first_access(&self) -> Option<usize> {
        self.swept.get().copied()
    }

    fn ensure_swept(&self) {
        self.swept.get_or_init(|| {
            let current = self.schema_version;
            let purged = self
                .store
                .retain(&|_, entry| entry.schema_version == current);
            if purged > 0 {
                tracing::warn!(
                    purged,
                    schema_version = current,
                    "Purged cache entries from another schema version"
                );
            }
            purged
        });
    }
}
