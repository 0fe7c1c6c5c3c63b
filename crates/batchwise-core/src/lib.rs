//! Result cache and bounded-concurrency batch scheduler for expensive,
//! rate-limited oracle calls.
//!
//! The pieces compose explicitly: build a [`ContentCache`] and a
//! [`MetricsCollector`], hand both to a [`ParallelScheduler`] together with an
//! [`Oracle`], then feed it batches from a [`BatchPlanner`].

pub mod cache;
mod config;
pub mod error;
pub mod fingerprint;
#[cfg(feature = "http")]
pub mod http_oracle;
pub mod metrics;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod test_support;
pub mod types;
pub mod util;

pub use cache::{
    CacheEntry, CacheSnapshot, CacheStats, CacheStore, ContentCache, DiskStore, MemoryStore,
    SnapshotCounters,
};
pub use config::{
    config_schema_json, load_config, write_schema_file, CacheConfig, Config, MetricsConfig,
    SchedulerConfig, StoreKind,
};
pub use error::{CachePersistenceError, ConfigurationError, OracleError, ScheduleError};
pub use fingerprint::CacheKeyer;
#[cfg(feature = "http")]
pub use http_oracle::HttpOracle;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use scheduler::{
    BatchPlanner, FnOracle, KeyedResults, Oracle, ParallelScheduler, PlannedWork,
    ResultExtractor, RunPhase, SchedulerBuilder, ThresholdPlanner,
};
pub use types::{Batch, ItemResult, ResultSource, RunMetrics, SchedulerResult, WorkItem};
