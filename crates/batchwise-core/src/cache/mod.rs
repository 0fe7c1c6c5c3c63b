//! Fingerprint-validated result cache with TTL expiry and size-bounded,
//! oldest-first eviction over a pluggable [`CacheStore`].
//!
//! Sizes, ages, fingerprints and counters live in an index under one lock.
//! Store calls happen after that lock is released; the `*_async` variants run
//! blocking stores on tokio's blocking pool.

mod disk;
mod snapshot;
mod store;

pub use disk::DiskStore;
pub use snapshot::{CacheSnapshot, SnapshotCounters};
pub use store::{CacheEntry, CacheStore, MemoryStore};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheConfig, StoreKind};
use crate::error::CachePersistenceError;
use crate::metrics::MetricsCollector;
use crate::util::now_millis;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub invalidated: u64,
    pub store_errors: u64,
    pub entries: u64,
    pub total_size: u64,
    pub capacity_bytes: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
    expired: u64,
    invalidated: u64,
}

#[derive(Debug, Clone)]
struct EntryMeta {
    created_at_ms: u64,
    ttl_ms: u64,
    seq: u64,
    size: u64,
    source_fingerprint: String,
}

impl EntryMeta {
    fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms
    }
}

#[derive(Default)]
struct Inner {
    index: HashMap<String, EntryMeta>,
    // (created_at_ms, write seq, key): first element is the eviction victim
    by_age: BTreeSet<(u64, u64, String)>,
    total_size: u64,
    next_seq: u64,
    counters: CacheCounters,
}

impl Inner {
    /// Index `entry` and return the write sequence number assigned to it.
    fn track(&mut self, entry: &CacheEntry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_age
            .insert((entry.created_at_ms, seq, entry.key.clone()));
        self.total_size = self.total_size.saturating_add(entry.size_hint);
        self.index.insert(
            entry.key.clone(),
            EntryMeta {
                created_at_ms: entry.created_at_ms,
                ttl_ms: entry.ttl_ms,
                seq,
                size: entry.size_hint,
                source_fingerprint: entry.source_fingerprint.clone(),
            },
        );
        seq
    }

    fn untrack(&mut self, key: &str) -> Option<EntryMeta> {
        let meta = self.index.remove(key)?;
        self.by_age
            .remove(&(meta.created_at_ms, meta.seq, key.to_string()));
        self.total_size = self.total_size.saturating_sub(meta.size);
        Some(meta)
    }

    /// Untrack `key` only while it still refers to write `seq`; a concurrent
    /// overwrite keeps its own entry.
    fn untrack_if(&mut self, key: &str, seq: u64) {
        if self.index.get(key).map(|meta| meta.seq) == Some(seq) {
            self.untrack(key);
        }
    }

    fn oldest_key(&self) -> Option<String> {
        self.by_age.iter().next().map(|(_, _, key)| key.clone())
    }

    fn reset_tracking(&mut self) {
        self.index.clear();
        self.by_age.clear();
        self.total_size = 0;
    }
}

enum Lookup {
    Miss,
    /// Expired or computed from other content; already untracked.
    Stale,
    Load(u64),
}

struct PendingSet {
    entry: CacheEntry,
    seq: u64,
    evicted: Option<String>,
}

pub struct ContentCache {
    inner: Mutex<Inner>,
    store: Arc<dyn CacheStore>,
    store_errors: AtomicU64,
    capacity_bytes: u64,
    default_ttl: Duration,
    metrics: Option<Arc<MetricsCollector>>,
    janitor: Mutex<Option<CancellationToken>>,
}

impl ContentCache {
    /// In-memory cache.
    pub fn new(capacity_bytes: u64, default_ttl: Duration) -> Self {
        Self::from_parts(
            Arc::new(MemoryStore::new()),
            Inner::default(),
            capacity_bytes,
            default_ttl,
        )
    }

    /// Cache over an existing store; entries already present are indexed.
    pub fn with_store(
        store: Box<dyn CacheStore>,
        capacity_bytes: u64,
        default_ttl: Duration,
    ) -> Result<Self, CachePersistenceError> {
        let store: Arc<dyn CacheStore> = Arc::from(store);
        let mut entries = store.entries()?;
        entries.sort_by_key(|entry| entry.created_at_ms);
        let mut inner = Inner::default();
        for entry in &entries {
            inner.track(entry);
        }
        tracing::debug!(
            store = store.kind(),
            entries = entries.len(),
            "content_cache opened"
        );
        Ok(Self::from_parts(store, inner, capacity_bytes, default_ttl))
    }

    pub fn from_config(cfg: &CacheConfig) -> Result<Self, CachePersistenceError> {
        match (cfg.store, cfg.store_dir()) {
            (StoreKind::Disk, Some(dir)) => {
                let store = DiskStore::open(dir)?;
                tracing::info!(dir = %store.dir().display(), "content_cache using disk store");
                Self::with_store(Box::new(store), cfg.capacity_bytes, cfg.ttl())
            }
            (StoreKind::Disk, None) => Err(CachePersistenceError::Store(
                "disk store requires cache.dir".into(),
            )),
            (StoreKind::Memory, _) => Ok(Self::new(cfg.capacity_bytes, cfg.ttl())),
        }
    }

    fn from_parts(
        store: Arc<dyn CacheStore>,
        inner: Inner,
        capacity_bytes: u64,
        default_ttl: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(inner),
            store,
            store_errors: AtomicU64::new(0),
            capacity_bytes,
            default_ttl,
            metrics: None,
            janitor: Mutex::new(None),
        }
    }

    /// Mirror hit/miss/set/eviction counts into a shared collector.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> u64 {
        self.inner.lock().total_size
    }

    fn miss(&self, inner: &mut Inner) {
        inner.counters.misses += 1;
        if let Some(m) = &self.metrics {
            m.record_cache_miss();
        }
    }

    fn store_error(&self, op: &str, key: &str, err: &CachePersistenceError) {
        tracing::warn!("content_cache::{} store error for {}: {}", op, key, err);
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `op` against the store, on the blocking pool when the store blocks.
    async fn run_store<T, F>(&self, op: F) -> Result<T, CachePersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CacheStore) -> Result<T, CachePersistenceError> + Send + 'static,
    {
        if !self.store.is_blocking() {
            return op(self.store.as_ref());
        }
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
            Ok(result) => result,
            Err(err) => Err(CachePersistenceError::Store(format!(
                "store task failed: {err}"
            ))),
        }
    }

    fn discard(&self, key: &str) {
        if let Err(err) = self.store.remove(key) {
            self.store_error("remove", key, &err);
        }
    }

    async fn discard_async(&self, key: &str) {
        let target = key.to_string();
        if let Err(err) = self.run_store(move |store| store.remove(&target)).await {
            self.store_error("remove", key, &err);
        }
    }

    /// Validate `key` against the index. Stale entries are untracked here and
    /// must be discarded from the store by the caller.
    fn check(&self, key: &str, current_fingerprint: &str) -> Lookup {
        let now = now_millis();
        let mut inner = self.inner.lock();
        let Some(meta) = inner.index.get(key) else {
            self.miss(&mut inner);
            return Lookup::Miss;
        };
        let expired = meta.is_expired_at(now);
        let changed = meta.source_fingerprint != current_fingerprint;
        if !expired && !changed {
            return Lookup::Load(meta.seq);
        }
        if expired {
            tracing::trace!(key, "content_cache::get expired");
            inner.counters.expired += 1;
        } else {
            tracing::debug!(key, "content_cache::get fingerprint changed; invalidating");
            inner.counters.invalidated += 1;
        }
        inner.untrack(key);
        self.miss(&mut inner);
        Lookup::Stale
    }

    fn finish_load(
        &self,
        key: &str,
        current_fingerprint: &str,
        seq: u64,
        loaded: Result<Option<CacheEntry>, CachePersistenceError>,
    ) -> Option<Value> {
        let loaded = loaded.unwrap_or_else(|err| {
            self.store_error("get", key, &err);
            None
        });
        let mut inner = self.inner.lock();
        match loaded {
            Some(entry)
                if entry.source_fingerprint == current_fingerprint
                    && !entry.is_expired_at(now_millis()) =>
            {
                inner.counters.hits += 1;
                if let Some(m) = &self.metrics {
                    m.record_cache_hit();
                }
                Some(entry.value)
            }
            _ => {
                tracing::debug!(key, "content_cache::get entry missing from store");
                inner.untrack_if(key, seq);
                self.miss(&mut inner);
                None
            }
        }
    }

    /// Return the cached value for `key` when it is unexpired and was computed
    /// from `current_fingerprint`. A stale entry is removed as a side effect.
    pub fn get(&self, key: &str, current_fingerprint: &str) -> Option<Value> {
        match self.check(key, current_fingerprint) {
            Lookup::Miss => None,
            Lookup::Stale => {
                self.discard(key);
                None
            }
            Lookup::Load(seq) => {
                let loaded = self.store.load(key);
                self.finish_load(key, current_fingerprint, seq, loaded)
            }
        }
    }

    /// [`get`](Self::get) for async callers.
    pub async fn get_async(&self, key: &str, current_fingerprint: &str) -> Option<Value> {
        match self.check(key, current_fingerprint) {
            Lookup::Miss => None,
            Lookup::Stale => {
                self.discard_async(key).await;
                None
            }
            Lookup::Load(seq) => {
                let target = key.to_string();
                let loaded = self.run_store(move |store| store.load(&target)).await;
                self.finish_load(key, current_fingerprint, seq, loaded)
            }
        }
    }

    /// Index the new entry, evicting the oldest one first when the insert
    /// would take the cache over capacity.
    fn begin_set(
        &self,
        key: &str,
        value: Value,
        source_fingerprint: &str,
        ttl: Duration,
        size_hint: Option<u64>,
    ) -> PendingSet {
        let size = size_hint.unwrap_or_else(|| {
            serde_json::to_vec(&value)
                .map(|bytes| bytes.len() as u64)
                .unwrap_or(0)
        });
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at_ms: now_millis(),
            ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
            source_fingerprint: source_fingerprint.to_string(),
            size_hint: size,
        };

        let mut inner = self.inner.lock();
        inner.untrack(key);
        let mut evicted = None;
        if inner.total_size.saturating_add(size) > self.capacity_bytes {
            if let Some(oldest) = inner.oldest_key() {
                tracing::debug!(
                    evicted = %oldest,
                    total_size = inner.total_size,
                    capacity = self.capacity_bytes,
                    "content_cache evicting oldest entry"
                );
                inner.untrack(&oldest);
                inner.counters.evictions += 1;
                if let Some(m) = &self.metrics {
                    m.record_cache_eviction();
                }
                evicted = Some(oldest);
            }
        }
        let seq = inner.track(&entry);
        PendingSet {
            entry,
            seq,
            evicted,
        }
    }

    /// Returns true when a failed write left something to clean up.
    fn finish_set(&self, key: &str, seq: u64, saved: Result<(), CachePersistenceError>) -> bool {
        match saved {
            Ok(()) => {
                self.inner.lock().counters.sets += 1;
                if let Some(m) = &self.metrics {
                    m.record_cache_set();
                }
                false
            }
            Err(err) => {
                self.store_error("set", key, &err);
                self.inner.lock().untrack_if(key, seq);
                true
            }
        }
    }

    /// Insert or overwrite an entry. When the insert would take the cache over
    /// capacity, the single oldest entry is evicted first.
    ///
    /// `size_hint = None` charges the serialised size of `value`.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        source_fingerprint: &str,
        ttl: Duration,
        size_hint: Option<u64>,
    ) {
        let PendingSet {
            entry,
            seq,
            evicted,
        } = self.begin_set(key, value, source_fingerprint, ttl, size_hint);
        if let Some(victim) = evicted {
            self.discard(&victim);
        }
        let saved = self.store.save(entry);
        if self.finish_set(key, seq, saved) {
            self.discard(key);
        }
    }

    /// [`set`](Self::set) for async callers.
    pub async fn set_async(
        &self,
        key: &str,
        value: Value,
        source_fingerprint: &str,
        ttl: Duration,
        size_hint: Option<u64>,
    ) {
        let PendingSet {
            entry,
            seq,
            evicted,
        } = self.begin_set(key, value, source_fingerprint, ttl, size_hint);
        if let Some(victim) = evicted {
            self.discard_async(&victim).await;
        }
        let saved = self.run_store(move |store| store.save(entry)).await;
        if self.finish_set(key, seq, saved) {
            self.discard_async(key).await;
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.untrack(key).is_some();
            if removed {
                inner.counters.deletes += 1;
            }
            removed
        };
        if removed {
            self.discard(key);
        }
        removed
    }

    /// Remove every entry and reset all counters.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.reset_tracking();
            inner.counters = CacheCounters::default();
        }
        self.store_errors.store(0, Ordering::Relaxed);
        if let Err(err) = self.store.clear() {
            tracing::warn!("content_cache::clear store error: {}", err);
            self.store_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn take_expired(&self) -> Vec<String> {
        let now = now_millis();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .index
            .iter()
            .filter(|(_, meta)| meta.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.untrack(key);
        }
        inner.counters.expired += expired.len() as u64;
        expired
    }

    /// Remove every entry whose TTL has elapsed; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let expired = self.take_expired();
        for key in &expired {
            self.discard(key);
        }
        expired.len()
    }

    /// [`cleanup_expired`](Self::cleanup_expired) for async callers.
    pub async fn cleanup_expired_async(&self) -> usize {
        let expired = self.take_expired();
        for key in &expired {
            self.discard_async(key).await;
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let c = inner.counters;
        let lookups = c.hits.saturating_add(c.misses);
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            sets: c.sets,
            deletes: c.deletes,
            evictions: c.evictions,
            expired: c.expired,
            invalidated: c.invalidated,
            store_errors: self.store_errors.load(Ordering::Relaxed),
            entries: inner.index.len() as u64,
            total_size: inner.total_size,
            capacity_bytes: self.capacity_bytes,
            hit_rate: if lookups > 0 {
                c.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Sweep expired entries every `interval` on a tokio task. Replaces any
    /// janitor already running for this cache. The task holds only a weak
    /// reference and exits once the cache is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.janitor.lock().replace(token.clone()) {
            previous.cancel();
        }
        let weak = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.cleanup_expired_async().await;
                if removed > 0 {
                    tracing::debug!(removed, "content_cache janitor swept expired entries");
                }
            }
        })
    }

    pub fn stop_janitor(&self) {
        if let Some(token) = self.janitor.lock().take() {
            token.cancel();
        }
    }

    /// Stop the janitor and drop every entry.
    pub fn destroy(&self) {
        self.stop_janitor();
        self.clear();
    }
}

impl Drop for ContentCache {
    fn drop(&mut self) {
        if let Some(token) = self.janitor.get_mut().take() {
            token.cancel();
        }
    }
}
