use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Invalid options or an invalid batch partition. Fatal: a run that hits one
/// of these never starts executing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("batch '{batch_id}' has no items")]
    EmptyBatch { batch_id: String },
    #[error("batch id '{batch_id}' is used more than once")]
    DuplicateBatchId { batch_id: String },
    #[error("item '{item_id}' appears in both {first} and {second}")]
    OverlappingItem {
        item_id: String,
        first: String,
        second: String,
    },
    #[error("invalid option {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure calling the external oracle. Recovered locally by retry and drain;
/// only ever surfaced as a per-item failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("oracle invocation failed: {0}")]
    Invocation(String),
    #[error("oracle rejected request: status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("oracle transport error: {0}")]
    Transport(String),
    #[error("oracle response decode failed: {0}")]
    Decode(String),
    #[error("could not extract batch results: {0}")]
    Extraction(String),
}

impl OracleError {
    pub fn invocation(msg: impl Into<String>) -> Self {
        OracleError::Invocation(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OracleError::Timeout { .. })
    }
}

/// Snapshot or backing-store I/O failure. Only returned from the explicit
/// persistence calls; in-memory `get`/`set` never fail because of it.
#[derive(Debug, Error)]
pub enum CachePersistenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache store error: {0}")]
    Store(String),
}

impl CachePersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CachePersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Non-fatal notes collected over a run.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleError {
    #[error("batch '{batch_id}' drained {items} item(s) to the single-item path: {reason}")]
    BatchDrained {
        batch_id: String,
        items: usize,
        reason: String,
    },
    #[error("item '{item_id}' failed after {attempts} attempt(s): {reason}")]
    ItemFailed {
        item_id: String,
        attempts: u32,
        reason: String,
    },
    #[error("run cancelled; {skipped} item(s) were not scheduled")]
    Cancelled { skipped: usize },
}
