//! Process-wide counters shared by the cache and the scheduler.
//!
//! Every increment is also forwarded to the `metrics` facade so a recorder
//! installed by the host binary can export it; with no recorder installed the
//! facade calls are no-ops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_sets: u64,
    pub cache_evictions: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub oracle_calls: u64,
    pub oracle_errors: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub runs: u64,
    pub cache_hit_rate: f64,
    pub success_rate: f64,
    pub avg_oracle_latency_ms: f64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_sets: AtomicU64,
    cache_evictions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    oracle_calls: AtomicU64,
    oracle_errors: AtomicU64,
    timeouts: AtomicU64,
    fallbacks: AtomicU64,
    runs: AtomicU64,
    oracle_latency_ms: AtomicU64,
}

pub struct MetricsCollector {
    enabled: AtomicBool,
    counters: Counters,
}

fn ratio(num: u64, denom: u64) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    /// A collector that ignores every record call.
    pub fn disabled() -> Self {
        let collector = Self::new();
        collector.set_enabled(false);
        collector
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64, by: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        counter.fetch_add(by, Ordering::Relaxed);
        true
    }

    pub fn record_cache_hit(&self) {
        if self.bump(&self.counters.cache_hits, 1) {
            ::metrics::counter!("batchwise_cache_hits_total").increment(1);
        }
    }

    pub fn record_cache_miss(&self) {
        if self.bump(&self.counters.cache_misses, 1) {
            ::metrics::counter!("batchwise_cache_misses_total").increment(1);
        }
    }

    pub fn record_cache_set(&self) {
        if self.bump(&self.counters.cache_sets, 1) {
            ::metrics::counter!("batchwise_cache_sets_total").increment(1);
        }
    }

    pub fn record_cache_eviction(&self) {
        if self.bump(&self.counters.cache_evictions, 1) {
            ::metrics::counter!("batchwise_cache_evictions_total").increment(1);
        }
    }

    pub fn record_success(&self) {
        if self.bump(&self.counters.successes, 1) {
            ::metrics::counter!("batchwise_items_total", "outcome" => "success").increment(1);
        }
    }

    pub fn record_failure(&self) {
        if self.bump(&self.counters.failures, 1) {
            ::metrics::counter!("batchwise_items_total", "outcome" => "failure").increment(1);
        }
    }

    pub fn record_retry(&self) {
        if self.bump(&self.counters.retries, 1) {
            ::metrics::counter!("batchwise_retries_total").increment(1);
        }
    }

    pub fn record_fallback(&self, items: u64) {
        if self.bump(&self.counters.fallbacks, items) {
            ::metrics::counter!("batchwise_fallback_items_total").increment(items);
        }
    }

    pub fn record_oracle_call(&self, latency_ms: u64, ok: bool, timed_out: bool) {
        if !self.bump(&self.counters.oracle_calls, 1) {
            return;
        }
        self.counters
            .oracle_latency_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        ::metrics::histogram!("batchwise_oracle_latency_ms").record(latency_ms as f64);
        if !ok {
            self.counters.oracle_errors.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("batchwise_oracle_errors_total").increment(1);
        }
        if timed_out {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("batchwise_oracle_timeouts_total").increment(1);
        }
    }

    pub fn record_run(&self) {
        if self.bump(&self.counters.runs, 1) {
            ::metrics::counter!("batchwise_runs_total").increment(1);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let cache_hits = load(&c.cache_hits);
        let cache_misses = load(&c.cache_misses);
        let successes = load(&c.successes);
        let failures = load(&c.failures);
        let oracle_calls = load(&c.oracle_calls);
        MetricsSnapshot {
            cache_hits,
            cache_misses,
            cache_sets: load(&c.cache_sets),
            cache_evictions: load(&c.cache_evictions),
            successes,
            failures,
            retries: load(&c.retries),
            oracle_calls,
            oracle_errors: load(&c.oracle_errors),
            timeouts: load(&c.timeouts),
            fallbacks: load(&c.fallbacks),
            runs: load(&c.runs),
            cache_hit_rate: ratio(cache_hits, cache_hits.saturating_add(cache_misses)),
            success_rate: ratio(successes, successes.saturating_add(failures)),
            avg_oracle_latency_ms: ratio(load(&c.oracle_latency_ms), oracle_calls),
        }
    }

    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.cache_hits,
            &c.cache_misses,
            &c.cache_sets,
            &c.cache_evictions,
            &c.successes,
            &c.failures,
            &c.retries,
            &c.oracle_calls,
            &c.oracle_errors,
            &c.timeouts,
            &c.fallbacks,
            &c.runs,
            &c.oracle_latency_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rates_are_derived_from_counts() {
        let m = MetricsCollector::new();
        m.record_cache_hit();
        m.record_cache_hit();
        m.record_cache_hit();
        m.record_cache_miss();
        m.record_success();
        m.record_failure();
        m.record_oracle_call(30, true, false);
        m.record_oracle_call(10, false, true);
        let snap = m.snapshot();
        assert_eq!(snap.cache_hit_rate, 0.75);
        assert_eq!(snap.success_rate, 0.5);
        assert_eq!(snap.oracle_calls, 2);
        assert_eq!(snap.oracle_errors, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.avg_oracle_latency_ms, 20.0);
    }

    #[test]
    fn empty_collector_reports_zero_rates() {
        let snap = MetricsCollector::new().snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
    }

    #[test]
    fn disabled_collector_records_nothing() {
        let m = MetricsCollector::disabled();
        m.record_cache_hit();
        m.record_retry();
        m.record_oracle_call(5, true, false);
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn reset_clears_counters() {
        let m = MetricsCollector::new();
        m.record_run();
        m.record_fallback(3);
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let m = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_retry();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().retries, 8000);
    }
}
