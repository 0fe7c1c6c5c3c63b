use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CachePersistenceError;

/// A stored result together with the data needed to decide whether it may
/// still be served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Epoch millis at write time.
    pub created_at_ms: u64,
    pub ttl_ms: u64,
    /// Content fingerprint the value was computed from.
    pub source_fingerprint: String,
    /// Bytes charged against the cache capacity.
    pub size_hint: u64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms
    }
}

/// Backing storage for [`ContentCache`](super::ContentCache).
///
/// The cache calls stores without holding its own lock, so implementations
/// synchronise themselves. Expiry, fingerprint checks and capacity accounting
/// live in the cache, not here.
pub trait CacheStore: Send + Sync {
    fn kind(&self) -> &'static str;
    /// Whether calls touch the filesystem or network. The cache moves blocking
    /// stores onto tokio's blocking pool on its async paths.
    fn is_blocking(&self) -> bool {
        false
    }
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CachePersistenceError>;
    fn save(&self, entry: CacheEntry) -> Result<(), CachePersistenceError>;
    fn remove(&self, key: &str) -> Result<(), CachePersistenceError>;
    fn clear(&self) -> Result<(), CachePersistenceError>;
    /// Every entry currently held, in no particular order.
    fn entries(&self) -> Result<Vec<CacheEntry>, CachePersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CachePersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, entry: CacheEntry) -> Result<(), CachePersistenceError> {
        self.entries.lock().insert(entry.key.clone(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CachePersistenceError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CachePersistenceError> {
        self.entries.lock().clear();
        Ok(())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, CachePersistenceError> {
        Ok(self.entries.lock().values().cloned().collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use super::*;

    /// Memory store that refuses to save one key, and optionally to remove it.
    pub(crate) struct RejectingStore {
        inner: MemoryStore,
        key: String,
        reject_removes: bool,
    }

    impl RejectingStore {
        pub(crate) fn new(key: &str) -> Self {
            Self {
                inner: MemoryStore::new(),
                key: key.to_string(),
                reject_removes: false,
            }
        }

        pub(crate) fn rejecting_removes(mut self) -> Self {
            self.reject_removes = true;
            self
        }

        fn refuse(&self, op: &str) -> CachePersistenceError {
            CachePersistenceError::Store(format!("{op} refused for {}", self.key))
        }
    }

    impl CacheStore for RejectingStore {
        fn kind(&self) -> &'static str {
            "rejecting"
        }

        fn load(&self, key: &str) -> Result<Option<CacheEntry>, CachePersistenceError> {
            self.inner.load(key)
        }

        fn save(&self, entry: CacheEntry) -> Result<(), CachePersistenceError> {
            if entry.key == self.key {
                return Err(self.refuse("save"));
            }
            self.inner.save(entry)
        }

        fn remove(&self, key: &str) -> Result<(), CachePersistenceError> {
            if self.reject_removes && key == self.key {
                return Err(self.refuse("remove"));
            }
            self.inner.remove(key)
        }

        fn clear(&self) -> Result<(), CachePersistenceError> {
            self.inner.clear()
        }

        fn entries(&self) -> Result<Vec<CacheEntry>, CachePersistenceError> {
            self.inner.entries()
        }
    }

    /// Blocking store whose loads sleep on the calling thread.
    pub(crate) struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl SlowStore {
        pub(crate) fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                delay,
            }
        }
    }

    impl CacheStore for SlowStore {
        fn kind(&self) -> &'static str {
            "slow"
        }

        fn is_blocking(&self) -> bool {
            true
        }

        fn load(&self, key: &str) -> Result<Option<CacheEntry>, CachePersistenceError> {
            std::thread::sleep(self.delay);
            self.inner.load(key)
        }

        fn save(&self, entry: CacheEntry) -> Result<(), CachePersistenceError> {
            self.inner.save(entry)
        }

        fn remove(&self, key: &str) -> Result<(), CachePersistenceError> {
            self.inner.remove(key)
        }

        fn clear(&self) -> Result<(), CachePersistenceError> {
            self.inner.clear()
        }

        fn entries(&self) -> Result<Vec<CacheEntry>, CachePersistenceError> {
            self.inner.entries()
        }
    }
}
