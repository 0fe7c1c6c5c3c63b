use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ScheduleError;
use crate::fingerprint::json_digest;

/// One unit of content to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unit name, unique within a run and stable across runs for the same unit.
    pub id: String,
    /// Path or logical owner of the unit.
    pub source_identity: String,
    /// Hash of the exact bytes that determine the result.
    pub content_fingerprint: String,
    /// Data handed to the oracle.
    pub payload: Value,
    /// Caller-owned weight used for batch planning.
    pub estimated_cost: u64,
}

impl WorkItem {
    /// Build an item whose fingerprint and cost are derived from the payload.
    pub fn new(id: impl Into<String>, source_identity: impl Into<String>, payload: Value) -> Self {
        let content_fingerprint = json_digest(&payload);
        let estimated_cost = serde_json::to_vec(&payload)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);
        Self {
            id: id.into(),
            source_identity: source_identity.into(),
            content_fingerprint,
            payload,
            estimated_cost,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.content_fingerprint = fingerprint.into();
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.estimated_cost = cost;
        self
    }
}

/// A non-empty, ordered group of items answered by a single oracle call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub items: Vec<WorkItem>,
    pub aggregate_cost: u64,
    /// Higher runs first.
    pub priority: i32,
}

impl Batch {
    pub fn new(id: impl Into<String>, items: Vec<WorkItem>) -> Self {
        let aggregate_cost = items
            .iter()
            .fold(0u64, |acc, item| acc.saturating_add(item.estimated_cost));
        Self {
            id: id.into(),
            items,
            aggregate_cost,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Payload sent to the oracle for the whole batch.
    pub fn combined_payload(&self) -> Value {
        let items: Vec<Value> = self
            .items
            .iter()
            .map(|item| {
                json!({
                    "id": item.id,
                    "source": item.source_identity,
                    "payload": item.payload,
                })
            })
            .collect();
        json!({ "batch_id": self.id, "items": items })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Oracle,
    /// Produced by the single-item path after the item's batch failed.
    Fallback,
    /// Never scheduled because the run was cancelled.
    Skipped,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Cache => "cache",
            ResultSource::Oracle => "oracle",
            ResultSource::Fallback => "fallback",
            ResultSource::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub source: ResultSource,
    /// Oracle invocations spent on this item, batch call included.
    pub attempts: u32,
}

impl ItemResult {
    pub fn succeeded(
        item_id: impl Into<String>,
        value: Value,
        source: ResultSource,
        duration_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            success: true,
            value: Some(value),
            error: None,
            duration_ms,
            source,
            attempts,
        }
    }

    pub fn failed(
        item_id: impl Into<String>,
        error: impl Into<String>,
        source: ResultSource,
        duration_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            success: false,
            value: None,
            error: Some(error.into()),
            duration_ms,
            source,
            attempts,
        }
    }
}

/// Counters for a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_items: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub oracle_calls: u64,
    pub fallbacks: u64,
    pub batches: u64,
    pub chunks: u64,
    pub wall_clock_ms: u64,
    /// Summed item time over wall-clock time; above 1.0 means work overlapped.
    pub parallel_efficiency: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerResult {
    pub results: Vec<ItemResult>,
    pub metrics: RunMetrics,
    pub errors: Vec<ScheduleError>,
}

impl SchedulerResult {
    pub fn get(&self, item_id: &str) -> Option<&ItemResult> {
        self.results.iter().find(|r| r.item_id == item_id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}
