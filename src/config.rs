//! Pipeline configuration
//!
//! Parsed from a TOML file (`chunkgraph.toml`) or built programmatically.
//! Sections:
//! - `[pipeline]`: run identity, store location, daily budget, logging
//! - `[scheduler]`: batch size, concurrency and cadence
//! - `[retry]`: per-chunk retry policy
//! - `[merge]`: confidence policy and synonym table
//! - `[llm]`: extraction endpoint
//! - `[[collections]]`: collections and their priorities
//!
//! Environment variables with the `CHUNKGRAPH_` prefix override file values:
//! - `CHUNKGRAPH_PIPELINE_NAME` → `pipeline.name`
//! - `CHUNKGRAPH_DB_PATH` → `pipeline.db_path`
//! - `CHUNKGRAPH_CHUNKS_DIR` → `pipeline.chunks_dir`
//! - `CHUNKGRAPH_DAILY_BUDGET` → `pipeline.daily_budget`
//! - `CHUNKGRAPH_LOG_LEVEL` → `pipeline.log_level`
//! - `CHUNKGRAPH_LLM_BASE_URL` → `llm.base_url`
//! - `CHUNKGRAPH_LLM_MODEL` → `llm.model`

use crate::graph::{ConfidencePolicy, MergePolicy};
use crate::pipeline::{RetryPolicy, SchedulerSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// A collection to process and its priority (lower runs first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

fn default_priority() -> u32 {
    100
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub collections: Vec<CollectionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Run-lock and usage key; two pipelines with different names never contend
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Root of `<collection>.jsonl` chunk files
    #[serde(default = "default_chunks_dir")]
    pub chunks_dir: PathBuf,
    #[serde(default = "default_daily_budget")]
    pub daily_budget: u64,
    /// Locks older than this are considered abandoned
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            db_path: default_db_path(),
            chunks_dir: default_chunks_dir(),
            daily_budget: default_daily_budget(),
            lock_ttl_secs: default_lock_ttl_secs(),
            max_errors: default_max_errors(),
            log_level: default_log_level(),
        }
    }
}

fn default_name() -> String {
    "default".to_string()
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chunkgraph")
        .join("graph.db")
}

fn default_chunks_dir() -> PathBuf {
    PathBuf::from("chunks")
}

fn default_daily_budget() -> u64 {
    1000
}

fn default_lock_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_max_errors() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    /// Extra pause after a batch that saw throttling
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_max_concurrent_batches() -> usize {
    2
}
fn default_inter_batch_delay_ms() -> u64 {
    1000
}
fn default_rate_limit_cooldown_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per step, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_rate_limit_backoff_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_reinforcement_bonus")]
    pub reinforcement_bonus: f64,
    #[serde(default)]
    pub confidence_policy: ConfidencePolicy,
    /// Surface name → canonical name
    #[serde(default)]
    pub synonyms: BTreeMap<String, String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            reinforcement_bonus: default_reinforcement_bonus(),
            confidence_policy: ConfidencePolicy::default(),
            synonyms: BTreeMap::new(),
        }
    }
}

fn default_reinforcement_bonus() -> f64 {
    crate::graph::merge::DEFAULT_REINFORCEMENT_BONUS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    /// Per-call timeout
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            temperature: 0.0,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

impl PipelineConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string without consulting the environment.
    pub fn parse_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHUNKGRAPH_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHUNKGRAPH_PIPELINE_NAME") {
            self.pipeline.name = v;
        }
        if let Some(v) = lookup("CHUNKGRAPH_DB_PATH") {
            self.pipeline.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHUNKGRAPH_CHUNKS_DIR") {
            self.pipeline.chunks_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHUNKGRAPH_DAILY_BUDGET") {
            match v.trim().parse() {
                Ok(n) => self.pipeline.daily_budget = n,
                Err(_) => tracing::warn!(value = %v, "Ignoring non-numeric CHUNKGRAPH_DAILY_BUDGET"),
            }
        }
        if let Some(v) = lookup("CHUNKGRAPH_LOG_LEVEL") {
            self.pipeline.log_level = v;
        }
        if let Some(v) = lookup("CHUNKGRAPH_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("CHUNKGRAPH_LLM_MODEL") {
            self.llm.model = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.name.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline.name must not be empty".into()));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be > 0".into()));
        }
        if self.scheduler.max_concurrent_batches == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_batches must be > 0".into(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_retries must be > 0 (it counts the first attempt)".into(),
            ));
        }
        let bonus = self.merge.reinforcement_bonus;
        if !(0.0..=1.0).contains(&bonus) {
            return Err(ConfigError::Invalid(format!(
                "merge.reinforcement_bonus must be within [0, 1] (got {})",
                bonus
            )));
        }
        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::Invalid("llm.timeout_secs must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for collection in &self.collections {
            if collection.name.trim().is_empty() {
                return Err(ConfigError::Invalid("collection name must not be empty".into()));
            }
            if !seen.insert(collection.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "collection '{}' listed twice",
                    collection.name
                )));
            }
        }
        Ok(())
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            reinforcement_bonus: self.merge.reinforcement_bonus,
            confidence: self.merge.confidence_policy,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            rate_limit_backoff: Duration::from_millis(self.retry.rate_limit_backoff_ms),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            batch_size: self.scheduler.batch_size,
            max_concurrent_batches: self.scheduler.max_concurrent_batches,
            inter_batch_delay: Duration::from_millis(self.scheduler.inter_batch_delay_ms),
            rate_limit_cooldown: Duration::from_millis(self.scheduler.rate_limit_cooldown_ms),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.pipeline.lock_ttl_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let config = PipelineConfig::parse_toml("").unwrap();
        assert_eq!(config.pipeline.name, "default");
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.merge.confidence_policy, ConfidencePolicy::Additive);
        assert!((config.merge.reinforcement_bonus - 0.05).abs() < 1e-12);
        assert!(config.collections.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let config = PipelineConfig::parse_toml(
            r#"
            [pipeline]
            name = "oss-kg"
            db_path = "/var/lib/chunkgraph/oss.db"
            daily_budget = 250

            [scheduler]
            batch_size = 5
            inter_batch_delay_ms = 0

            [retry]
            max_retries = 4

            [merge]
            confidence_policy = "max_plus_bonus"
            reinforcement_bonus = 0.1

            [merge.synonyms]
            "Foreign Investment Company" = "PT PMA"

            [llm]
            model = "qwen2.5"

            [[collections]]
            name = "kbli"
            priority = 1

            [[collections]]
            name = "perizinan"
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.name, "oss-kg");
        assert_eq!(config.pipeline.daily_budget, 250);
        assert_eq!(config.scheduler.batch_size, 5);
        assert_eq!(config.scheduler.max_concurrent_batches, 2);
        assert_eq!(config.retry_policy().max_retries, 4);
        assert_eq!(config.merge_policy().confidence, ConfidencePolicy::MaxPlusBonus);
        assert_eq!(config.merge.synonyms["Foreign Investment Company"], "PT PMA");
        assert_eq!(config.llm.model, "qwen2.5");
        assert_eq!(config.llm.base_url, "http://localhost:11434");
        assert_eq!(config.collections[0], CollectionSpec::new("kbli", 1));
        assert_eq!(config.collections[1].priority, 100);
        assert_eq!(config.scheduler_settings().inter_batch_delay, Duration::ZERO);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = PipelineConfig::parse_toml("[scheduler]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_out_of_range_bonus() {
        let err = PipelineConfig::parse_toml("[merge]\nreinforcement_bonus = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_duplicate_collections() {
        let err = PipelineConfig::parse_toml(
            "[[collections]]\nname = \"kbli\"\n[[collections]]\nname = \"kbli\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = PipelineConfig::parse_toml("[pipeline\nname = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CHUNKGRAPH_DB_PATH", "/tmp/override.db"),
            ("CHUNKGRAPH_DAILY_BUDGET", "42"),
            ("CHUNKGRAPH_LLM_MODEL", "mistral"),
        ]);
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.pipeline.db_path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.pipeline.daily_budget, 42);
        assert_eq!(config.llm.model, "mistral");
        assert_eq!(config.pipeline.log_level, "info");
    }

    #[test]
    fn bad_numeric_override_is_ignored() {
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| (key == "CHUNKGRAPH_DAILY_BUDGET").then(|| "lots".to_string()));
        assert_eq!(config.pipeline.daily_budget, 1000);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = PipelineConfig::from_file("/nonexistent/chunkgraph.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
