//! Environment-driven configuration.
//!
//! Each binary loads a typed config at startup and fails fast when a required
//! variable is missing. Area paths accept either plain filesystem paths or
//! `gs://` / `s3://` URLs; sibling areas (staging, extracts, `_health`)
//! default to directories next to the configured landing area, mirroring the
//! conventional bucket layout.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};

/// Warehouse loader backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderBackend {
    DuckDb,
    BigQuery,
}

impl FromStr for LoaderBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "duckdb" => Ok(LoaderBackend::DuckDb),
            "bigquery" => Ok(LoaderBackend::BigQuery),
            other => bail!("unknown LOADER_BACKEND '{other}' (expected duckdb or bigquery)"),
        }
    }
}

/// Partner extract output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractFormat {
    Jsonl,
    Avro,
}

impl FromStr for ExtractFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" => Ok(ExtractFormat::Jsonl),
            "avro" => Ok(ExtractFormat::Avro),
            other => bail!("unknown EXTRACT_FORMAT '{other}' (expected jsonl or avro)"),
        }
    }
}

impl fmt::Display for ExtractFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractFormat::Jsonl => write!(f, "jsonl"),
            ExtractFormat::Avro => write!(f, "avro"),
        }
    }
}

/// Configuration for the batch pipeline (validator + orchestrator).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub landing_path: String,
    pub staging_path: String,
    pub archive_path: String,
    pub failed_path: String,
    pub extracts_path: String,
    pub health_path: String,
    /// Directory tree of source spec YAML documents.
    pub table_config_path: String,

    pub workers: usize,
    pub backend: LoaderBackend,
    pub duckdb_path: String,
    pub gcp_project: Option<String>,
    pub bq_dataset: Option<String>,
    pub staging_bucket: Option<String>,
    pub control_dataset: String,

    pub dbt_project_dir: String,
    pub dbt_profiles_dir: String,
    pub dbt_target: String,
    pub dbt_timeout_seconds: u64,

    /// UTC hour at which the partner extract is generated.
    pub extract_hour: u32,
    pub extract_format: ExtractFormat,
    pub extract_window_days: i64,
}

impl PipelineConfig {
    pub fn from_env() -> Result<PipelineConfig> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<PipelineConfig> {
        let landing_path = required(get, "LANDING_PATH")?;
        let backend: LoaderBackend = parsed(get, "LOADER_BACKEND", LoaderBackend::DuckDb)?;

        let config = PipelineConfig {
            staging_path: get("STAGING_PATH").unwrap_or_else(|| sibling(&landing_path, "staging")),
            extracts_path: get("EXTRACTS_PATH")
                .unwrap_or_else(|| sibling(&landing_path, "extracts")),
            health_path: get("HEALTH_PATH").unwrap_or_else(|| sibling(&landing_path, "_health")),
            archive_path: required(get, "ARCHIVE_PATH")?,
            failed_path: required(get, "FAILED_PATH")?,
            table_config_path: required(get, "TABLE_CONFIG_PATH")?,
            workers: parsed(get, "LOADER_WORKERS", 1usize)?,
            backend,
            duckdb_path: get("DUCKDB_PATH").unwrap_or_else(|| "dev.duckdb".to_string()),
            gcp_project: get("GCP_PROJECT"),
            bq_dataset: get("BQ_DATASET"),
            staging_bucket: get("STAGING_BUCKET"),
            control_dataset: get("CONTROL_DATASET").unwrap_or_else(|| "control".to_string()),
            dbt_project_dir: get("DBT_PROJECT_DIR")
                .unwrap_or_else(|| "/app/dbt_project".to_string()),
            dbt_profiles_dir: get("DBT_PROFILES_DIR")
                .unwrap_or_else(|| "/app/dbt_project".to_string()),
            dbt_target: get("DBT_TARGET").unwrap_or_else(|| "int".to_string()),
            dbt_timeout_seconds: parsed(get, "DBT_TIMEOUT_SECONDS", 3600u64)?,
            extract_hour: parsed(get, "EXTRACT_HOUR", 6u32)?,
            extract_format: parsed(get, "EXTRACT_FORMAT", ExtractFormat::Jsonl)?,
            extract_window_days: parsed(get, "EXTRACT_WINDOW_DAYS", 7i64)?,
            landing_path,
        };

        if config.backend == LoaderBackend::BigQuery
            && (config.gcp_project.is_none()
                || config.bq_dataset.is_none()
                || config.staging_bucket.is_none())
        {
            bail!("BigQuery backend requires GCP_PROJECT, BQ_DATASET, and STAGING_BUCKET");
        }

        Ok(config)
    }
}

/// Configuration for the streaming bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub pubsub_project: String,
    pub pubsub_topic: String,

    /// Pause the consumer once the buffer holds this many messages.
    pub buffer_max_size: usize,
    /// Resume the consumer once the buffer drains to this many messages.
    pub buffer_resume_size: usize,
    pub publish_batch_size: usize,
    pub publish_timeout_seconds: f64,

    /// Report degraded health when nothing has been ingested for this long.
    pub max_lag_seconds: i64,
}

impl BridgeConfig {
    pub fn from_env() -> Result<BridgeConfig> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<BridgeConfig> {
        let config = BridgeConfig {
            kafka_brokers: required(get, "KAFKA_BROKERS")?,
            kafka_topic: required(get, "KAFKA_TOPIC")?,
            kafka_group_id: get("KAFKA_GROUP_ID").unwrap_or_else(|| "pubsub-bridge".to_string()),
            pubsub_project: required(get, "PROJECT_ID")?,
            pubsub_topic: required(get, "PUBSUB_TOPIC")?,
            buffer_max_size: parsed(get, "BUFFER_MAX_SIZE", 10_000usize)?,
            buffer_resume_size: parsed(get, "BUFFER_RESUME_SIZE", 5_000usize)?,
            publish_batch_size: parsed(get, "PUBLISH_BATCH_SIZE", 100usize)?,
            publish_timeout_seconds: parsed(get, "PUBLISH_TIMEOUT_SECONDS", 30.0f64)?,
            max_lag_seconds: parsed(get, "MAX_LAG_SECONDS", 300i64)?,
        };

        if config.buffer_resume_size > config.buffer_max_size {
            bail!(
                "BUFFER_RESUME_SIZE ({}) must not exceed BUFFER_MAX_SIZE ({})",
                config.buffer_resume_size,
                config.buffer_max_size
            );
        }

        Ok(config)
    }
}

/// Retry policy for outbound submissions.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay_seconds: 1.0,
            max_delay_seconds: 16.0,
            exponential_base: 2.0,
        }
    }
}

/// Configuration for the reporter service.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub regulator_api_url: String,
    pub regulator_api_key: String,
    pub refresh_interval_seconds: u64,
    pub cache_miss_timeout_seconds: f64,
    pub stale_threshold_seconds: i64,
    pub retry: RetryConfig,
    pub port: u16,
}

impl ReporterConfig {
    pub fn from_env() -> Result<ReporterConfig> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<ReporterConfig> {
        Ok(ReporterConfig {
            regulator_api_url: required(get, "REGULATOR_API_URL")?,
            regulator_api_key: get("REGULATOR_API_KEY").unwrap_or_default(),
            refresh_interval_seconds: parsed(get, "CACHE_REFRESH_SECONDS", 300u64)?,
            cache_miss_timeout_seconds: parsed(get, "CACHE_MISS_TIMEOUT_SECONDS", 5.0f64)?,
            stale_threshold_seconds: parsed(get, "CACHE_STALE_SECONDS", 600i64)?,
            retry: RetryConfig {
                max_attempts: parsed(get, "RETRY_MAX_ATTEMPTS", 5u32)?,
                initial_delay_seconds: parsed(get, "RETRY_INITIAL_DELAY", 1.0f64)?,
                max_delay_seconds: parsed(get, "RETRY_MAX_DELAY", 16.0f64)?,
                exponential_base: parsed(get, "RETRY_EXPONENTIAL_BASE", 2.0f64)?,
            },
            port: parsed(get, "PORT", 8080u16)?,
        })
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn required(get: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{name} is required"))
}

fn parsed<T>(get: &dyn Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid value for {name}")),
        None => Ok(default),
    }
}

/// Replace the last path segment: `gs://b/landing` -> `gs://b/staging`.
fn sibling(path: &str, name: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/{name}"),
        None => name.to_string(),
    }
}
