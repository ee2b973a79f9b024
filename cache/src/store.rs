//! Backing storage for [`ResultCache`](crate::ResultCache).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use keystone_types::CacheKey;

/// A type-erased cached result.
///
/// `value` holds a `Result<T, Failure>` for whatever `T` the writer used.
#[derive(Clone)]
pub struct StoredEntry {
    pub value: Arc<dyn Any + Send + Sync>,
    pub timestamp: Instant,
    pub schema_version: u32,
}

impl fmt::Debug for StoredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredEntry")
            .field("timestamp", &self.timestamp)
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

/// Keyed entry storage. Every method is one atomic map operation.
pub trait ResultStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> Option<StoredEntry>;

    /// Insert or overwrite.
    fn store(&self, key: CacheKey, entry: StoredEntry);

    fn remove(&self, key: &CacheKey) -> bool;

    /// Remove `key` only if its current entry matches `predicate`.
    fn remove_if(&self, key: &CacheKey, predicate: &dyn Fn(&StoredEntry) -> bool) -> bool;

    /// Keep entries matching `keep`; returns how many were removed.
    fn retain(&self, keep: &dyn Fn(&CacheKey, &StoredEntry) -> bool) -> usize;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store. The lock is held for a single map operation only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CacheKey, StoredEntry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, StoredEntry>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResultStore for MemoryStore {
    fn load(&self, key: &CacheKey) -> Option<StoredEntry> {
        self.entries().get(key).cloned()
    }

    fn store(&self, key: CacheKey, entry: StoredEntry) {
        self.entries().insert(key, entry);
    }

    fn remove(&self, key: &CacheKey) -> bool {
        self.entries().remove(key).is_some()
    }

    fn remove_if(&self, key: &CacheKey, predicate: &dyn Fn(&StoredEntry) -> bool) -> bool {
        let mut entries = self.entries();
        if entries.get(key).is_some_and(predicate) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    fn retain(&self, keep: &dyn Fn(&CacheKey, &StoredEntry) -> bool) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, entry| keep(key, entry));
        before - entries.len()
    }

    fn clear(&self) {
        self.entries().clear();
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}
