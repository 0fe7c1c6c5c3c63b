//! Bounded-concurrency execution of batches and single items against an
//! [`Oracle`], with cache reuse, per-item retry and batch drain fallback.
//!
//! A run moves through [`RunPhase`]s: options and the batch partition are
//! checked while planning; execution units (batches by priority, then single
//! items) run in chunks of at most `max_concurrency`, each chunk settling
//! before the next starts. A batch that fails, or whose response leaves
//! members unresolved, drains those members one by one through the single-item
//! path inside its own concurrency slot.

mod oracle;
mod plan;
mod planner;

pub use oracle::{FnOracle, KeyedResults, Oracle, ResultExtractor};
pub use planner::{BatchPlanner, PlannedWork, ThresholdPlanner};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ContentCache;
use crate::config::{Config, SchedulerConfig};
use crate::error::{ConfigurationError, OracleError, ScheduleError};
use crate::fingerprint::CacheKeyer;
use crate::metrics::MetricsCollector;
use crate::types::{Batch, ItemResult, ResultSource, RunMetrics, SchedulerResult, WorkItem};
use plan::{build_units, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Planning,
    Running,
    /// Running, with at least one batch recovering members on the single-item path.
    Draining,
    Completed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Planning => "planning",
            RunPhase::Running => "running",
            RunPhase::Draining => "draining",
            RunPhase::Completed => "completed",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RunPhase::Planning,
            2 => RunPhase::Running,
            3 => RunPhase::Draining,
            4 => RunPhase::Completed,
            _ => RunPhase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunPhase::Idle => 0,
            RunPhase::Planning => 1,
            RunPhase::Running => 2,
            RunPhase::Draining => 3,
            RunPhase::Completed => 4,
        }
    }
}

pub struct SchedulerBuilder {
    oracle: Arc<dyn Oracle>,
    config: SchedulerConfig,
    cache: Option<Arc<ContentCache>>,
    cache_enabled: bool,
    cache_ttl: Option<Duration>,
    keyer: CacheKeyer,
    metrics: Option<Arc<MetricsCollector>>,
    extractor: Arc<dyn ResultExtractor>,
}

impl SchedulerBuilder {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            config: SchedulerConfig::default(),
            cache: None,
            cache_enabled: true,
            cache_ttl: None,
            keyer: CacheKeyer::default(),
            metrics: None,
            extractor: Arc::new(KeyedResults),
        }
    }

    /// Take scheduler options, cache TTL, namespace and the caching toggle from a
    /// loaded [`Config`].
    pub fn apply_config(mut self, cfg: &Config) -> Self {
        self.config = cfg.scheduler.clone();
        self.cache_enabled = cfg.cache.enabled;
        self.cache_ttl = Some(cfg.cache.ttl());
        self.keyer = CacheKeyer::new(cfg.cache.namespace.clone());
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn caching(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// TTL for entries this scheduler writes; defaults to the cache's own TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn keyer(mut self, keyer: CacheKeyer) -> Self {
        self.keyer = keyer;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn ResultExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn build(self) -> Result<ParallelScheduler, ConfigurationError> {
        self.config.validate()?;
        let cache = if self.cache_enabled { self.cache } else { None };
        let cache_ttl = self
            .cache_ttl
            .or_else(|| cache.as_ref().map(|c| c.default_ttl()))
            .unwrap_or_else(|| Duration::from_millis(crate::config::DEFAULT_CACHE_TTL_MS));
        Ok(ParallelScheduler {
            oracle: self.oracle,
            config: self.config,
            cache,
            cache_ttl,
            keyer: self.keyer,
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(MetricsCollector::new())),
            extractor: self.extractor,
            phase: AtomicU8::new(RunPhase::Idle.as_u8()),
            draining: AtomicUsize::new(0),
        })
    }
}

pub struct ParallelScheduler {
    oracle: Arc<dyn Oracle>,
    config: SchedulerConfig,
    cache: Option<Arc<ContentCache>>,
    cache_ttl: Duration,
    keyer: CacheKeyer,
    metrics: Arc<MetricsCollector>,
    extractor: Arc<dyn ResultExtractor>,
    phase: AtomicU8,
    draining: AtomicUsize,
}

#[derive(Default)]
struct RunCounters {
    oracle_calls: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
}

impl RunCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct UnitOutcome {
    results: Vec<ItemResult>,
    errors: Vec<ScheduleError>,
}

impl UnitOutcome {
    fn push_single(&mut self, (result, error): (ItemResult, Option<ScheduleError>)) {
        self.results.push(result);
        self.errors.extend(error);
    }
}

/// How the single-item path was reached.
#[derive(Clone, Copy)]
enum SinglePath {
    Individual,
    /// Drained from a failed batch; the batch call is already counted.
    Drained { batch_attempts: u32 },
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

/// Split `total` across `parts` with the remainder on the first share.
fn split_duration(total: u64, parts: usize) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let n = parts as u64;
    let mut shares = vec![total / n; parts];
    shares[0] += total % n;
    shares
}

impl ParallelScheduler {
    pub fn builder(oracle: Arc<dyn Oracle>) -> SchedulerBuilder {
        SchedulerBuilder::new(oracle)
    }

    pub fn phase(&self) -> RunPhase {
        let phase = RunPhase::from_u8(self.phase.load(Ordering::Acquire));
        if phase == RunPhase::Running && self.draining.load(Ordering::Acquire) > 0 {
            RunPhase::Draining
        } else {
            phase
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
        tracing::debug!(phase = phase.as_str(), "scheduler phase");
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn cache(&self) -> Option<&Arc<ContentCache>> {
        self.cache.as_ref()
    }

    pub async fn run(
        &self,
        batches: Vec<Batch>,
        individual: Vec<WorkItem>,
    ) -> Result<SchedulerResult, ConfigurationError> {
        self.run_with_cancel(batches, individual, &CancellationToken::new())
            .await
    }

    /// Plan `items` with `planner`, then run the result.
    pub async fn run_planned(
        &self,
        planner: &dyn BatchPlanner,
        items: Vec<WorkItem>,
    ) -> Result<SchedulerResult, ConfigurationError> {
        let planned = planner.plan(items);
        self.run(planned.batches, planned.individual).await
    }

    /// Like [`run`](Self::run), but stops scheduling new chunks once `cancel`
    /// fires. The chunk in flight finishes; items never scheduled come back as
    /// failed results with [`ResultSource::Skipped`].
    pub async fn run_with_cancel(
        &self,
        batches: Vec<Batch>,
        individual: Vec<WorkItem>,
        cancel: &CancellationToken,
    ) -> Result<SchedulerResult, ConfigurationError> {
        let run_id = Uuid::new_v4();
        self.set_phase(RunPhase::Planning);
        let units = match self.config.validate().and_then(|_| build_units(batches, individual)) {
            Ok(units) => units,
            Err(err) => {
                tracing::warn!(%run_id, "scheduler rejected run: {}", err);
                self.set_phase(RunPhase::Idle);
                return Err(err);
            }
        };

        let total_items: usize = units.iter().map(Unit::item_count).sum();
        let batch_count = units.iter().filter(|u| matches!(u, Unit::Batch(_))).count();
        let max = self.config.max_concurrency.max(1);
        tracing::info!(
            %run_id,
            items = total_items,
            batches = batch_count,
            max_concurrency = max,
            namespace = self.keyer.namespace(),
            "scheduler run starting"
        );

        self.set_phase(RunPhase::Running);
        let started = Instant::now();
        let counters = RunCounters::default();
        let mut results: Vec<ItemResult> = Vec::with_capacity(total_items);
        let mut errors: Vec<ScheduleError> = Vec::new();
        let mut chunks = 0u64;
        let mut pending = units.into_iter().peekable();

        while pending.peek().is_some() {
            if chunks > 0 && !self.config.chunk_delay().is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.chunk_delay()) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            let chunk: Vec<Unit> = pending.by_ref().take(max).collect();
            chunks += 1;
            tracing::debug!(%run_id, chunk = chunks, units = chunk.len(), "running chunk");
            let outcomes = join_all(chunk.iter().map(|unit| self.execute_unit(unit, &counters))).await;
            for outcome in outcomes {
                results.extend(outcome.results);
                errors.extend(outcome.errors);
            }
        }

        let skipped: Vec<String> = pending.flat_map(|unit| unit.item_ids()).collect();
        if !skipped.is_empty() {
            tracing::info!(%run_id, skipped = skipped.len(), "scheduler run cancelled");
            errors.push(ScheduleError::Cancelled {
                skipped: skipped.len(),
            });
            results.extend(skipped.into_iter().map(|id| {
                ItemResult::failed(id, "run cancelled before scheduling", ResultSource::Skipped, 0, 0)
            }));
        }

        let wall_clock_ms = elapsed_ms(started);
        let metrics = self.summarize(&results, &counters, batch_count as u64, chunks, wall_clock_ms);
        self.metrics.record_run();
        self.set_phase(RunPhase::Completed);
        tracing::info!(
            %run_id,
            items = metrics.total_items,
            succeeded = metrics.succeeded,
            failed = metrics.failed,
            cache_hits = metrics.cache_hits,
            oracle_calls = metrics.oracle_calls,
            retries = metrics.retries,
            wall_clock_ms,
            parallel_efficiency = metrics.parallel_efficiency,
            "scheduler run complete"
        );
        Ok(SchedulerResult {
            results,
            metrics,
            errors,
        })
    }

    fn summarize(
        &self,
        results: &[ItemResult],
        counters: &RunCounters,
        batches: u64,
        chunks: u64,
        wall_clock_ms: u64,
    ) -> RunMetrics {
        let total_items = results.len() as u64;
        let cache_hits = results
            .iter()
            .filter(|r| r.source == ResultSource::Cache)
            .count() as u64;
        let skipped = results
            .iter()
            .filter(|r| r.source == ResultSource::Skipped)
            .count() as u64;
        let succeeded = results.iter().filter(|r| r.success).count() as u64;
        let item_time: u64 = results.iter().map(|r| r.duration_ms).sum();
        for result in results {
            if result.success {
                self.metrics.record_success();
            } else {
                self.metrics.record_failure();
            }
        }
        RunMetrics {
            total_items,
            cache_hits,
            cache_misses: if self.cache.is_some() {
                total_items.saturating_sub(skipped).saturating_sub(cache_hits)
            } else {
                0
            },
            succeeded,
            failed: total_items - succeeded,
            retries: RunCounters::get(&counters.retries),
            oracle_calls: RunCounters::get(&counters.oracle_calls),
            fallbacks: RunCounters::get(&counters.fallbacks),
            batches,
            chunks,
            wall_clock_ms,
            parallel_efficiency: if wall_clock_ms > 0 {
                item_time as f64 / wall_clock_ms as f64
            } else {
                0.0
            },
        }
    }

    async fn execute_unit(&self, unit: &Unit, counters: &RunCounters) -> UnitOutcome {
        match unit {
            Unit::Batch(batch) => self.run_batch(batch, counters).await,
            Unit::Single(item) => {
                let mut outcome = UnitOutcome::default();
                outcome.push_single(self.run_single(item, counters, SinglePath::Individual).await);
                outcome
            }
        }
    }

    async fn call_oracle(&self, payload: &Value, counters: &RunCounters) -> Result<Value, OracleError> {
        let timeout = self.config.per_call_timeout();
        let started = Instant::now();
        RunCounters::bump(&counters.oracle_calls, 1);
        let outcome = match tokio::time::timeout(timeout, self.oracle.invoke(payload)).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout {
                timeout_ms: self.config.per_call_timeout_ms,
            }),
        };
        let timed_out = matches!(&outcome, Err(err) if err.is_timeout());
        self.metrics
            .record_oracle_call(elapsed_ms(started), outcome.is_ok(), timed_out);
        outcome
    }

    async fn lookup_item(&self, item: &WorkItem) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        cache
            .get_async(&self.keyer.item_key(item), &item.content_fingerprint)
            .await
    }

    async fn store_item(&self, item: &WorkItem, value: &Value) {
        if let Some(cache) = &self.cache {
            cache
                .set_async(
                    &self.keyer.item_key(item),
                    value.clone(),
                    &item.content_fingerprint,
                    self.cache_ttl,
                    None,
                )
                .await;
        }
    }

    async fn run_single(
        &self,
        item: &WorkItem,
        counters: &RunCounters,
        path: SinglePath,
    ) -> (ItemResult, Option<ScheduleError>) {
        let started = Instant::now();
        let (success_source, mut attempts) = match path {
            SinglePath::Individual => {
                if let Some(value) = self.lookup_item(item).await {
                    let result = ItemResult::succeeded(
                        item.id.clone(),
                        value,
                        ResultSource::Cache,
                        elapsed_ms(started),
                        0,
                    );
                    tracing::debug!(item = %item.id, source = result.source.as_str(), "item resolved");
                    return (result, None);
                }
                (ResultSource::Oracle, 0u32)
            }
            SinglePath::Drained { batch_attempts } => (ResultSource::Fallback, batch_attempts),
        };

        let max_attempts = self.config.retry_attempts.saturating_add(1);
        let mut tries = 0u32;
        let last_error = loop {
            tries += 1;
            if tries > 1 || matches!(path, SinglePath::Drained { .. }) {
                RunCounters::bump(&counters.retries, 1);
                self.metrics.record_retry();
            }
            attempts = attempts.saturating_add(1);
            match self.call_oracle(&item.payload, counters).await {
                Ok(value) => {
                    self.store_item(item, &value).await;
                    let result = ItemResult::succeeded(
                        item.id.clone(),
                        value,
                        success_source,
                        elapsed_ms(started),
                        attempts,
                    );
                    tracing::debug!(item = %item.id, source = result.source.as_str(), attempts, "item resolved");
                    return (result, None);
                }
                Err(err) if tries < max_attempts => {
                    tracing::debug!(item = %item.id, attempt = tries, "oracle call failed, retrying: {}", err);
                    if !self.config.retry_delay().is_zero() {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
                Err(err) => break err,
            }
        };

        tracing::warn!(
            item = %item.id,
            source = success_source.as_str(),
            attempts,
            "item failed permanently: {}",
            last_error
        );
        let reason = last_error.to_string();
        let result = ItemResult::failed(
            item.id.clone(),
            reason.clone(),
            success_source,
            elapsed_ms(started),
            attempts,
        );
        let error = ScheduleError::ItemFailed {
            item_id: item.id.clone(),
            attempts,
            reason,
        };
        (result, Some(error))
    }

    /// Serve a whole batch from a cached batch entry, if every member is present.
    async fn cached_batch(&self, batch: &Batch) -> Option<HashMap<String, Value>> {
        let cache = self.cache.as_ref()?;
        let value = cache
            .get_async(
                &self.keyer.batch_key(batch),
                &CacheKeyer::batch_fingerprint(batch),
            )
            .await?;
        let Value::Object(map) = value else {
            return None;
        };
        let mut out = HashMap::with_capacity(batch.len());
        for item in &batch.items {
            out.insert(item.id.clone(), map.get(&item.id)?.clone());
        }
        Some(out)
    }

    fn serve_cached(
        batch: &Batch,
        mut values: HashMap<String, Value>,
        started: Instant,
    ) -> UnitOutcome {
        let mut outcome = UnitOutcome::default();
        let shares = split_duration(elapsed_ms(started), batch.len());
        for (item, share) in batch.items.iter().zip(shares) {
            if let Some(value) = values.remove(&item.id) {
                outcome.results.push(ItemResult::succeeded(
                    item.id.clone(),
                    value,
                    ResultSource::Cache,
                    share,
                    0,
                ));
            }
        }
        outcome
    }

    async fn run_batch(&self, batch: &Batch, counters: &RunCounters) -> UnitOutcome {
        let started = Instant::now();
        let mut outcome = UnitOutcome::default();

        if let Some(values) = self.cached_batch(batch).await {
            tracing::debug!(batch = %batch.id, items = batch.len(), "batch cache hit");
            return Self::serve_cached(batch, values, started);
        }
        // member hits that don't cover the whole batch are kept for the drain
        let mut member_hits: HashMap<String, Value> = HashMap::new();
        for item in &batch.items {
            if let Some(value) = self.lookup_item(item).await {
                member_hits.insert(item.id.clone(), value);
            }
        }
        if member_hits.len() == batch.len() {
            tracing::debug!(batch = %batch.id, items = batch.len(), "batch served from item cache");
            return Self::serve_cached(batch, member_hits, started);
        }

        let response = self
            .call_oracle(&batch.combined_payload(), counters)
            .await
            .and_then(|response| self.extractor.extract(batch, &response));
        let (mut resolved, failure) = match response {
            Ok(map) => (map, None),
            Err(err) => (HashMap::new(), Some(err.to_string())),
        };

        for item in &batch.items {
            if let Some(value) = resolved.get(&item.id) {
                self.store_item(item, value).await;
            }
        }
        let complete = batch.items.iter().all(|item| resolved.contains_key(&item.id));
        if complete {
            if let Some(cache) = &self.cache {
                let entry: serde_json::Map<String, Value> = batch
                    .items
                    .iter()
                    .filter_map(|item| resolved.get(&item.id).map(|v| (item.id.clone(), v.clone())))
                    .collect();
                cache
                    .set_async(
                        &self.keyer.batch_key(batch),
                        Value::Object(entry),
                        &CacheKeyer::batch_fingerprint(batch),
                        self.cache_ttl,
                        None,
                    )
                    .await;
            }
        }

        let shares = split_duration(elapsed_ms(started), batch.len());
        let mut drained: Vec<(&WorkItem, u64)> = Vec::new();
        for (item, share) in batch.items.iter().zip(shares) {
            match resolved.remove(&item.id) {
                Some(value) => outcome.results.push(ItemResult::succeeded(
                    item.id.clone(),
                    value,
                    ResultSource::Oracle,
                    share,
                    1,
                )),
                None => drained.push((item, share)),
            }
        }
        if drained.is_empty() {
            return outcome;
        }

        let reason = failure.unwrap_or_else(|| {
            format!("batch response did not resolve {} item(s)", drained.len())
        });
        tracing::info!(
            batch = %batch.id,
            drained = drained.len(),
            "batch drained to single-item path: {}",
            reason
        );
        outcome.errors.push(ScheduleError::BatchDrained {
            batch_id: batch.id.clone(),
            items: drained.len(),
            reason,
        });

        self.draining.fetch_add(1, Ordering::AcqRel);
        for (item, share) in drained {
            if let Some(value) = member_hits.remove(&item.id) {
                outcome.results.push(ItemResult::succeeded(
                    item.id.clone(),
                    value,
                    ResultSource::Cache,
                    share,
                    1,
                ));
                continue;
            }
            RunCounters::bump(&counters.fallbacks, 1);
            self.metrics.record_fallback(1);
            let (mut result, error) = self
                .run_single(item, counters, SinglePath::Drained { batch_attempts: 1 })
                .await;
            result.duration_ms = result.duration_ms.saturating_add(share);
            outcome.push_single((result, error));
        }
        self.draining.fetch_sub(1, Ordering::AcqRel);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_scheduler(config: SchedulerConfig) -> ParallelScheduler {
        let oracle = FnOracle::new(|payload: Value| async move { Ok(json!({"seen": payload})) });
        ParallelScheduler::builder(Arc::new(oracle))
            .config(config)
            .build()
            .unwrap()
    }

    #[test]
    fn duration_split_preserves_total() {
        assert_eq!(split_duration(10, 3), vec![4, 3, 3]);
        assert_eq!(split_duration(0, 2), vec![0, 0]);
        assert!(split_duration(5, 0).is_empty());
    }

    #[test]
    fn builder_rejects_zero_concurrency() {
        let oracle = FnOracle::new(|_| async { Ok(json!(null)) });
        let err = ParallelScheduler::builder(Arc::new(oracle))
            .config(SchedulerConfig {
                max_concurrency: 0,
                ..SchedulerConfig::default()
            })
            .build()
            .err()
            .expect("invalid concurrency");
        assert!(matches!(err, ConfigurationError::InvalidOption { .. }));
    }

    #[tokio::test]
    async fn empty_run_completes_immediately() {
        let scheduler = echo_scheduler(SchedulerConfig::default());
        assert_eq!(scheduler.phase(), RunPhase::Idle);
        let out = scheduler.run(vec![], vec![]).await.unwrap();
        assert!(out.results.is_empty());
        assert_eq!(out.metrics.total_items, 0);
        assert_eq!(out.metrics.chunks, 0);
        assert_eq!(out.metrics.oracle_calls, 0);
        assert_eq!(scheduler.phase(), RunPhase::Completed);
    }

    #[tokio::test]
    async fn rejected_partition_leaves_scheduler_idle() {
        let scheduler = echo_scheduler(SchedulerConfig::default());
        let err = scheduler
            .run(vec![Batch::new("empty", vec![])], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyBatch { .. }));
        assert_eq!(scheduler.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn singles_without_cache_go_to_the_oracle() {
        let scheduler = echo_scheduler(SchedulerConfig {
            batch_chunk_delay_ms: 0,
            ..SchedulerConfig::default()
        });
        let items = vec![
            WorkItem::new("a", "a.rs", json!(1)),
            WorkItem::new("b", "b.rs", json!(2)),
        ];
        let out = scheduler.run(vec![], items).await.unwrap();
        assert!(out.all_succeeded());
        assert_eq!(out.metrics.oracle_calls, 2);
        assert_eq!(out.metrics.cache_misses, 0);
        assert_eq!(out.get("b").unwrap().value, Some(json!({"seen": 2})));
        assert_eq!(out.get("a").unwrap().source, ResultSource::Oracle);
    }
}
