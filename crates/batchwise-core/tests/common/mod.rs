#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchwise_core::{Oracle, OracleError, SchedulerConfig, WorkItem};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub fn item(id: &str) -> WorkItem {
    WorkItem::new(
        id,
        format!("src/{id}.rs"),
        json!({"id": id, "body": format!("content of {id}")}),
    )
}

pub fn items(ids: &[&str]) -> Vec<WorkItem> {
    ids.iter().map(|id| item(id)).collect()
}

/// No delays, generous timeout.
pub fn fast_config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        batch_chunk_delay_ms: 0,
        retry_attempts: 2,
        retry_delay_ms: 0,
        per_call_timeout_ms: 2_000,
    }
}

struct FailRule {
    ids: HashSet<String>,
    remaining: u32,
}

/// Oracle double that answers every payload, records concurrency and can be
/// told to fail specific calls.
#[derive(Default)]
pub struct ScriptedOracle {
    delay: Duration,
    fail_batches: bool,
    omit: HashSet<String>,
    rules: Mutex<Vec<FailRule>>,
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<Vec<String>>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every combined batch call fails; single-item calls succeed.
    pub fn failing_batches(mut self) -> Self {
        self.fail_batches = true;
        self
    }

    /// Leave `id` out of batch responses.
    pub fn omitting(mut self, id: &str) -> Self {
        self.omit.insert(id.to_string());
        self
    }

    /// Fail the next `times` calls whose payload touches any of `ids`.
    pub fn fail_touching(self, ids: &[&str], times: u32) -> Self {
        self.rules.lock().push(FailRule {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            remaining: times,
        });
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Item ids touched by each call, in call order.
    pub fn call_log(&self) -> Vec<Vec<String>> {
        self.log.lock().clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn touched(payload: &Value) -> (bool, Vec<String>) {
        match payload.get("items").and_then(Value::as_array) {
            Some(members) => (
                true,
                members
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect(),
            ),
            None => (
                false,
                payload
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|id| vec![id.to_string()])
                    .unwrap_or_default(),
            ),
        }
    }

    fn should_fail(&self, ids: &[String]) -> bool {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if rule.remaining > 0 && ids.iter().any(|id| rule.ids.contains(id)) {
                rule.remaining -= 1;
                return true;
            }
        }
        false
    }
}

fn verdict(id: &str) -> Value {
    json!({"item": id, "verdict": "ok"})
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn invoke(&self, payload: &Value) -> Result<Value, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let (is_batch, ids) = Self::touched(payload);
        self.log.lock().push(ids.clone());
        if is_batch {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fail = (is_batch && self.fail_batches) || self.should_fail(&ids);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if fail {
            return Err(OracleError::invocation(format!("scripted failure for {ids:?}")));
        }
        if is_batch {
            let results: serde_json::Map<String, Value> = ids
                .iter()
                .filter(|id| !self.omit.contains(*id))
                .map(|id| (id.clone(), verdict(id)))
                .collect();
            Ok(json!({ "results": results }))
        } else {
            Ok(verdict(ids.first().map(String::as_str).unwrap_or("?")))
        }
    }
}
