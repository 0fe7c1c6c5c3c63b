use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::util::{env_bool, env_u64, parse_byte_size};

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_BATCH_CHUNK_DELAY_MS: u64 = 400;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 750;
pub const DEFAULT_PER_CALL_TIMEOUT_MS: u64 = 25_000;
pub const DEFAULT_CACHE_TTL_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on batch/item executions in flight at once.
    pub max_concurrency: usize,
    /// Pause between chunks, to stay under the oracle's rate limit.
    pub batch_chunk_delay_ms: u64,
    /// Retries per item after the first attempt on the single-item path.
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Timeout applied to every oracle invocation.
    pub per_call_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            batch_chunk_delay_ms: DEFAULT_BATCH_CHUNK_DELAY_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            per_call_timeout_ms: DEFAULT_PER_CALL_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.batch_chunk_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::InvalidOption {
                option: "scheduler.max_concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.per_call_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidOption {
                option: "scheduler.per_call_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Disk,
}

impl StoreKind {
    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Some(StoreKind::Memory),
            "disk" | "fs" | "file" => Some(StoreKind::Disk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub capacity_bytes: u64,
    pub store: StoreKind,
    /// Entry directory for the disk store.
    pub dir: Option<String>,
    /// Period of the expired-entry sweep; 0 disables the janitor.
    pub cleanup_interval_ms: u64,
    /// Mixed into every cache key; bump it to orphan old results.
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
            store: StoreKind::Memory,
            dir: None,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            namespace: "batchwise".into(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_ms > 0).then(|| Duration::from_millis(self.cleanup_interval_ms))
    }

    pub fn store_dir(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(PathBuf::from)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.ttl_ms == 0 {
            return Err(ConfigurationError::InvalidOption {
                option: "cache.ttl_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.capacity_bytes == 0 {
            return Err(ConfigurationError::InvalidOption {
                option: "cache.capacity_bytes",
                reason: "must be greater than zero".into(),
            });
        }
        if self.store == StoreKind::Disk && self.dir.is_none() {
            return Err(ConfigurationError::InvalidOption {
                option: "cache.dir",
                reason: "required when cache.store = \"disk\"".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Defaults overlaid with `BATCHWISE_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        if let Some(n) = env_u64("BATCHWISE_MAX_CONCURRENCY") {
            self.scheduler.max_concurrency = n as usize;
        }
        if let Some(ms) = env_u64("BATCHWISE_BATCH_CHUNK_DELAY_MS") {
            self.scheduler.batch_chunk_delay_ms = ms;
        }
        if let Some(n) = env_u64("BATCHWISE_RETRY_ATTEMPTS") {
            self.scheduler.retry_attempts = n.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = env_u64("BATCHWISE_RETRY_DELAY_MS") {
            self.scheduler.retry_delay_ms = ms;
        }
        if let Some(ms) = env_u64("BATCHWISE_PER_CALL_TIMEOUT_MS") {
            self.scheduler.per_call_timeout_ms = ms;
        }
        if let Some(flag) = env_bool("BATCHWISE_CACHE") {
            self.cache.enabled = flag;
        }
        if let Some(ms) = env_u64("BATCHWISE_CACHE_TTL_MS") {
            self.cache.ttl_ms = ms;
        }
        if let Ok(raw) = std::env::var("BATCHWISE_CACHE_CAPACITY") {
            match parse_byte_size(&raw) {
                Some(bytes) => self.cache.capacity_bytes = bytes,
                None => tracing::warn!(
                    "invalid BATCHWISE_CACHE_CAPACITY '{}'; keeping {}",
                    raw,
                    self.cache.capacity_bytes
                ),
            }
        }
        if let Ok(raw) = std::env::var("BATCHWISE_CACHE_STORE") {
            match StoreKind::from_slug(&raw) {
                Some(kind) => self.cache.store = kind,
                None => tracing::warn!("invalid BATCHWISE_CACHE_STORE '{}'; ignoring", raw),
            }
        }
        if let Ok(dir) = std::env::var("BATCHWISE_CACHE_DIR") {
            let trimmed = dir.trim();
            if !trimmed.is_empty() {
                self.cache.dir = Some(trimmed.to_string());
            }
        }
        if let Some(ms) = env_u64("BATCHWISE_CACHE_CLEANUP_MS") {
            self.cache.cleanup_interval_ms = ms;
        }
        if let Ok(ns) = std::env::var("BATCHWISE_CACHE_NAMESPACE") {
            let trimmed = ns.trim();
            if !trimmed.is_empty() {
                self.cache.namespace = trimmed.to_string();
            }
        }
        if let Some(flag) = env_bool("BATCHWISE_METRICS") {
            self.metrics.enabled = flag;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.scheduler.validate()?;
        self.cache.validate()
    }
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &str) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Load a TOML config file, validate it against the schema, then apply env
/// overrides and semantic checks.
pub fn load_config(path: &str) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading config at {path}"))?;
    let raw: toml::Value =
        toml::from_str(&content).with_context(|| format!("parsing config at {path}"))?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigurationError::Invalid(validation_errors.join(", ")).into());
    }
    let mut cfg: Config = toml::from_str(&content)?;
    cfg.apply_env();
    cfg.validate()?;
    Ok(cfg)
}
