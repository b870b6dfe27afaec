use crate::engine::EngineSettings;
use crate::sink_writer::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tickscope_domain::services::window::{DEFAULT_MAX_FUTURE_SKEW_MS, LONGEST_LOOKBACK_MS};
use tickscope_domain::value_objects::duration::parse_duration_like_ms;
use tickscope_domain::value_objects::ranking::RankingMetric;

pub const DEFAULT_METRICS_TABLE: &str = "crypto_metrics";
pub const DEFAULT_GAINERS_TABLE: &str = "top_gainers";
pub const DEFAULT_LOSERS_TABLE: &str = "top_losers";
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Jsonl,
    Csv,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub indicators: IndicatorsConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub retry: Option<RetryConfig>,
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Evaluation cadence, e.g. "30s".
    pub eval_interval: String,
    /// Ranking cadence, e.g. "5m".
    pub ranking_interval: String,
    /// How far ahead of the clock a tick may be stamped, e.g. "1m". Defaults to one minute.
    pub max_future_skew: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IndicatorsConfig {
    pub ma_period: i64,
    pub retention: String,
    pub ranking_metric: Option<RankingMetric>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: String,
    pub follow: Option<bool>,
    pub batch_size: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub url: Option<String>,
    pub metrics_table: Option<String>,
    pub gainers_table: Option<String>,
    pub losers_table: Option<String>,
    pub pool_max_size: Option<u32>,
}

impl SinkConfig {
    pub fn metrics_table(&self) -> &str {
        self.metrics_table.as_deref().unwrap_or(DEFAULT_METRICS_TABLE)
    }

    pub fn gainers_table(&self) -> &str {
        self.gainers_table.as_deref().unwrap_or(DEFAULT_GAINERS_TABLE)
    }

    pub fn losers_table(&self) -> &str {
        self.losers_table.as_deref().unwrap_or(DEFAULT_LOSERS_TABLE)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: Option<i64>,
    pub initial_backoff: Option<String>,
    pub max_backoff: Option<String>,
    pub max_deferred_batches: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub metrics_addr: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config, String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {}", path.display(), err))?;
    toml::from_str(&contents)
        .map_err(|err| format!("failed to parse TOML {}: {}", path.display(), err))
}

pub fn to_toml_pretty(config: &Config) -> Result<String, String> {
    toml::to_string_pretty(config)
        .map_err(|err| format!("failed to serialize config as TOML: {err}"))
}

/// Validates the config and derives the engine settings. Any error here is fatal at startup.
pub fn resolve_settings(config: &Config) -> Result<EngineSettings, String> {
    let eval_interval_ms = positive_duration("pipeline.eval_interval", &config.pipeline.eval_interval)?;
    let ranking_interval_ms =
        positive_duration("pipeline.ranking_interval", &config.pipeline.ranking_interval)?;

    if config.indicators.ma_period <= 0 {
        return Err(format!(
            "invalid config: indicators.ma_period must be > 0 (got {})",
            config.indicators.ma_period
        ));
    }
    let ma_period = config.indicators.ma_period as usize;

    let configured_retention = positive_duration("indicators.retention", &config.indicators.retention)?;
    let ma_span_ms = eval_interval_ms.saturating_mul(config.indicators.ma_period);
    let retention_ms = configured_retention
        .max(LONGEST_LOOKBACK_MS)
        .max(ma_span_ms);
    if retention_ms != configured_retention {
        tracing::warn!(
            configured_ms = configured_retention,
            effective_ms = retention_ms,
            "retention raised to cover the longest lookback and moving-average span"
        );
    }

    let max_future_skew_ms = match config.pipeline.max_future_skew.as_deref() {
        None => DEFAULT_MAX_FUTURE_SKEW_MS,
        Some(raw) => {
            let ms = parse_duration_like_ms(raw)
                .map_err(|err| format!("invalid config: pipeline.max_future_skew: {err}"))?;
            if ms < 0 {
                return Err(format!(
                    "invalid config: pipeline.max_future_skew must be >= 0 (got {raw:?})"
                ));
            }
            ms
        }
    };

    let batch_size = match config.source.batch_size {
        None => DEFAULT_BATCH_SIZE,
        Some(size) if size > 0 => size as usize,
        Some(size) => {
            return Err(format!(
                "invalid config: source.batch_size must be > 0 (got {size})"
            ))
        }
    };
    if config.source.path.trim().is_empty() {
        return Err("invalid config: source.path is empty".to_string());
    }

    for (name, table) in [
        ("sink.metrics_table", config.sink.metrics_table()),
        ("sink.gainers_table", config.sink.gainers_table()),
        ("sink.losers_table", config.sink.losers_table()),
    ] {
        if table.trim().is_empty() {
            return Err(format!("invalid config: {name} is empty"));
        }
    }
    if config.sink.pool_max_size == Some(0) {
        return Err("invalid config: sink.pool_max_size must be > 0".to_string());
    }

    Ok(EngineSettings {
        eval_interval_ms,
        ranking_interval_ms,
        ma_period,
        retention_ms,
        max_future_skew_ms,
        ranking_metric: config.indicators.ranking_metric.unwrap_or_default(),
        batch_size,
        retry: resolve_retry(config.retry.as_ref())?,
    })
}

fn resolve_retry(retry: Option<&RetryConfig>) -> Result<RetryPolicy, String> {
    let defaults = RetryPolicy::default();
    let Some(retry) = retry else {
        return Ok(defaults);
    };

    let max_attempts = match retry.max_attempts {
        None => defaults.max_attempts,
        Some(n) if n > 0 && n <= u32::MAX as i64 => n as u32,
        Some(n) => {
            return Err(format!(
                "invalid config: retry.max_attempts must be > 0 (got {n})"
            ))
        }
    };
    let initial_backoff_ms = match retry.initial_backoff.as_deref() {
        None => defaults.initial_backoff_ms,
        Some(raw) => positive_duration("retry.initial_backoff", raw)? as u64,
    };
    let max_backoff_ms = match retry.max_backoff.as_deref() {
        None => defaults.max_backoff_ms.max(initial_backoff_ms),
        Some(raw) => positive_duration("retry.max_backoff", raw)? as u64,
    };
    if max_backoff_ms < initial_backoff_ms {
        return Err(format!(
            "invalid config: retry.max_backoff ({max_backoff_ms}ms) is shorter than retry.initial_backoff ({initial_backoff_ms}ms)"
        ));
    }
    let max_deferred_batches = match retry.max_deferred_batches {
        None => defaults.max_deferred_batches,
        Some(n) if n > 0 => n as usize,
        Some(n) => {
            return Err(format!(
                "invalid config: retry.max_deferred_batches must be > 0 (got {n})"
            ))
        }
    };

    Ok(RetryPolicy {
        max_attempts,
        initial_backoff_ms,
        max_backoff_ms,
        max_deferred_batches,
    })
}

fn positive_duration(name: &str, raw: &str) -> Result<i64, String> {
    let ms = parse_duration_like_ms(raw).map_err(|err| format!("invalid config: {name}: {err}"))?;
    if ms <= 0 {
        return Err(format!("invalid config: {name} must be > 0 (got {raw:?})"));
    }
    Ok(ms)
}
