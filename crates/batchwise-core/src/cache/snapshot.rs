use std::path::Path;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use super::{CacheCounters, CacheEntry, CacheStore, ContentCache, Inner};
use crate::error::CachePersistenceError;
use crate::util::{now_millis, now_rfc3339};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCounters {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
}

/// Serialisable image of a cache: every entry plus the lookup counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub saved_at: String,
    pub entries: Vec<CacheEntry>,
    #[serde(default)]
    pub counters: SnapshotCounters,
}

/// Unexpired entries of `snapshot`, oldest first.
fn live_entries(snapshot: CacheSnapshot) -> (Vec<CacheEntry>, SnapshotCounters) {
    let now = now_millis();
    let mut entries: Vec<CacheEntry> = snapshot
        .entries
        .into_iter()
        .filter(|entry| !entry.is_expired_at(now))
        .collect();
    entries.sort_by_key(|entry| entry.created_at_ms);
    (entries, snapshot.counters)
}

fn write_all(store: &dyn CacheStore, entries: &[CacheEntry]) -> Result<(), CachePersistenceError> {
    store.clear()?;
    for entry in entries {
        store.save(entry.clone())?;
    }
    Ok(())
}

/// Make `entries` the whole store content. A failed write puts the previous
/// content back before the error is returned.
fn replace_stored(
    store: &dyn CacheStore,
    entries: &[CacheEntry],
) -> Result<(), CachePersistenceError> {
    let previous = store.entries()?;
    if let Err(err) = write_all(store, entries) {
        if let Err(rollback) = write_all(store, &previous) {
            tracing::warn!("content_cache::restore rollback failed: {}", rollback);
        }
        return Err(err);
    }
    Ok(())
}

impl ContentCache {
    /// Entries are ordered oldest first.
    pub fn snapshot(&self) -> Result<CacheSnapshot, CachePersistenceError> {
        let entries = self.store.entries()?;
        Ok(self.snapshot_of(entries))
    }

    fn snapshot_of(&self, mut entries: Vec<CacheEntry>) -> CacheSnapshot {
        let inner = self.inner.lock();
        entries.retain(|entry| inner.index.contains_key(&entry.key));
        entries.sort_by(|a, b| {
            let seq = |e: &CacheEntry| inner.index.get(&e.key).map(|m| m.seq).unwrap_or(0);
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| seq(a).cmp(&seq(b)))
        });
        let c = inner.counters;
        CacheSnapshot {
            saved_at: now_rfc3339(),
            entries,
            counters: SnapshotCounters {
                hits: c.hits,
                misses: c.misses,
                sets: c.sets,
                deletes: c.deletes,
            },
        }
    }

    /// Swap in an index built from `entries`, already written to the store.
    fn install(&self, entries: &[CacheEntry], counters: SnapshotCounters) -> usize {
        let mut fresh = Inner::default();
        for entry in entries {
            fresh.track(entry);
        }
        fresh.counters = CacheCounters {
            hits: counters.hits,
            misses: counters.misses,
            sets: counters.sets,
            deletes: counters.deletes,
            ..CacheCounters::default()
        };
        *self.inner.lock() = fresh;
        self.store_errors.store(0, Ordering::Relaxed);
        tracing::debug!(restored = entries.len(), "content_cache restored from snapshot");
        entries.len()
    }

    /// Replace the whole cache content with `snapshot`. Entries that expired
    /// since the snapshot was taken are dropped; the rest keep their original
    /// creation time and TTL. On error the cache keeps its previous content.
    pub fn restore(&self, snapshot: CacheSnapshot) -> Result<usize, CachePersistenceError> {
        let (entries, counters) = live_entries(snapshot);
        replace_stored(self.store.as_ref(), &entries)?;
        Ok(self.install(&entries, counters))
    }

    /// Write the snapshot as JSON via a temp file and rename.
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize, CachePersistenceError> {
        let entries = self.run_store(|store| store.entries()).await?;
        let snapshot = self.snapshot_of(entries);
        let count = snapshot.entries.len();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CachePersistenceError::io(parent, err))?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|err| CachePersistenceError::io(&tmp, err))?;
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CachePersistenceError::io(path, err));
        }
        tracing::info!(entries = count, path = %path.display(), "cache snapshot saved");
        Ok(count)
    }

    /// Load a snapshot written by [`save_snapshot`](Self::save_snapshot) and
    /// make it the entire cache content. An absent file leaves the cache as it
    /// is and reports zero entries loaded.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize, CachePersistenceError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no cache snapshot to load");
                return Ok(0);
            }
            Err(err) => return Err(CachePersistenceError::io(path, err)),
        };
        let snapshot: CacheSnapshot = serde_json::from_slice(&bytes)?;
        let (entries, counters) = live_entries(snapshot);
        let entries = self
            .run_store(move |store| replace_stored(store, &entries).map(|()| entries))
            .await?;
        let restored = self.install(&entries, counters);
        tracing::info!(entries = restored, path = %path.display(), "cache snapshot loaded");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::super::store::testing::RejectingStore;
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn save_and_load_replaces_content() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("cache.json");

        let source = ContentCache::new(1024, TTL);
        source.set("a", json!({"v": 1}), "fa", TTL, None);
        source.set("b", json!({"v": 2}), "fb", TTL, None);
        let _ = source.get("a", "fa");
        assert_eq!(source.save_snapshot(&path).await.unwrap(), 2);

        let target = ContentCache::new(1024, TTL);
        target.set("stale", json!(0), "fs", TTL, None);
        assert_eq!(target.load_snapshot(&path).await.unwrap(), 2);
        assert_eq!(target.len(), 2);
        assert_eq!(target.get("stale", "fs"), None);
        assert_eq!(target.get("a", "fa"), Some(json!({"v": 1})));
        assert_eq!(target.get("b", "other"), None);
        let stats = target.stats();
        // one hit carried over, one new
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let tmp = tempdir().unwrap();
        let cache = ContentCache::new(1024, TTL);
        cache.set("keep", json!(1), "fp", TTL, None);
        let loaded = cache
            .load_snapshot(&tmp.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(loaded, 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(&path, b"not json").unwrap();
        let cache = ContentCache::new(1024, TTL);
        let err = cache.load_snapshot(&path).await.unwrap_err();
        assert!(matches!(err, CachePersistenceError::Serde(_)));
    }

    #[test]
    fn restore_skips_expired_entries() {
        let now = now_millis();
        let snapshot = CacheSnapshot {
            saved_at: now_rfc3339(),
            entries: vec![
                CacheEntry {
                    key: "old".into(),
                    value: json!(1),
                    created_at_ms: now.saturating_sub(10_000),
                    ttl_ms: 1_000,
                    source_fingerprint: "fp".into(),
                    size_hint: 1,
                },
                CacheEntry {
                    key: "fresh".into(),
                    value: json!(2),
                    created_at_ms: now,
                    ttl_ms: 60_000,
                    source_fingerprint: "fp".into(),
                    size_hint: 1,
                },
            ],
            counters: SnapshotCounters::default(),
        };
        let cache = ContentCache::new(1024, TTL);
        assert_eq!(cache.restore(snapshot).unwrap(), 1);
        assert_eq!(cache.get("fresh", "fp"), Some(json!(2)));
    }

    #[test]
    fn snapshot_orders_oldest_first() {
        let cache = ContentCache::new(1024, TTL);
        for key in ["x", "y", "z"] {
            cache.set(key, json!(key), "fp", TTL, Some(1));
        }
        let keys: Vec<_> = cache
            .snapshot()
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["x", "y", "z"]);
    }

    fn entry(key: &str) -> CacheEntry {
        CacheEntry {
            key: key.into(),
            value: json!(key),
            created_at_ms: now_millis(),
            ttl_ms: 60_000,
            source_fingerprint: "fp".into(),
            size_hint: 1,
        }
    }

    #[test]
    fn failed_restore_keeps_previous_content() {
        let cache =
            ContentCache::with_store(Box::new(RejectingStore::new("poison")), 1024, TTL).unwrap();
        cache.set("a", json!("a"), "fp", TTL, Some(1));
        cache.set("b", json!("b"), "fp", TTL, Some(1));
        let _ = cache.get("a", "fp");
        let before = cache.stats();

        let snapshot = CacheSnapshot {
            saved_at: now_rfc3339(),
            entries: vec![entry("x"), entry("poison")],
            counters: SnapshotCounters::default(),
        };
        assert!(matches!(
            cache.restore(snapshot),
            Err(CachePersistenceError::Store(_))
        ));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("x", "fp"), None);
        assert_eq!(cache.get("a", "fp"), Some(json!("a")));
        assert_eq!(cache.get("b", "fp"), Some(json!("b")));
        let after = cache.stats();
        assert_eq!(after.sets, before.sets);
        assert_eq!(after.hits, before.hits + 2);
        let mut stored: Vec<_> = cache
            .snapshot()
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.key)
            .collect();
        stored.sort();
        assert_eq!(stored, vec!["a", "b"]);
    }
}
