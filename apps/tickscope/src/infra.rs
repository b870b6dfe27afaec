use std::env;
use std::path::Path;
use std::sync::Arc;
use tickscope_application::config::{Config, SinkKind, SourceKind};
use tickscope_domain::repositories::sink::MetricsSink;
use tickscope_domain::repositories::tick_source::TickSource;
use tickscope_infrastructure::persistence::memory::MemoryMetricsSink;
use tickscope_infrastructure::persistence::postgres_metrics::{PostgresMetricsSink, SinkTables};
use tickscope_infrastructure::sources::csv_file::CsvFileSource;
use tickscope_infrastructure::sources::jsonl::JsonlFileSource;

const DEFAULT_POOL_MAX_SIZE: u32 = 4;

pub type SharedSink = Arc<dyn MetricsSink + Send + Sync>;

pub fn sink_tables(config: &Config) -> SinkTables {
    SinkTables {
        metrics: config.sink.metrics_table().to_string(),
        gainers: config.sink.gainers_table().to_string(),
        losers: config.sink.losers_table().to_string(),
    }
}

/// Checks the sink section beyond what the settings resolver covers.
pub fn validate_sink(config: &Config) -> Result<(), String> {
    sink_tables(config)
        .validate()
        .map_err(|err| format!("invalid config: {err}"))?;
    if config.sink.kind == SinkKind::Postgres {
        resolve_db_url(config)?;
    }
    Ok(())
}

pub fn resolve_db_url(config: &Config) -> Result<String, String> {
    match config.sink.url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(url.to_string()),
        _ => env::var("TICKSCOPE_DB_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                "invalid config: missing sink.url and env TICKSCOPE_DB_URL is not set".to_string()
            }),
    }
}

pub fn build_postgres_sink(config: &Config) -> Result<PostgresMetricsSink, String> {
    let db_url = resolve_db_url(config)?;
    PostgresMetricsSink::new(
        &db_url,
        sink_tables(config),
        config.sink.pool_max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE),
    )
}

pub fn build_sink(config: &Config) -> Result<SharedSink, String> {
    match config.sink.kind {
        SinkKind::Postgres => Ok(Arc::new(build_postgres_sink(config)?)),
        SinkKind::Memory => Ok(Arc::new(MemoryMetricsSink::new())),
    }
}

pub fn open_source(
    kind: SourceKind,
    path: &Path,
    follow: bool,
) -> Result<Box<dyn TickSource + Send>, String> {
    match kind {
        SourceKind::Jsonl => Ok(Box::new(JsonlFileSource::open(path, follow)?)),
        SourceKind::Csv => {
            if follow {
                tracing::warn!("source.follow is ignored for csv sources");
            }
            Ok(Box::new(CsvFileSource::open(path)?))
        }
    }
}

pub fn build_source(config: &Config) -> Result<Box<dyn TickSource + Send>, String> {
    open_source(
        config.source.kind,
        Path::new(&config.source.path),
        config.source.follow.unwrap_or(false),
    )
}

/// Replay inputs are picked by extension; anything but `.csv` is read as JSON lines.
pub fn source_kind_for(path: &Path) -> SourceKind {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => SourceKind::Csv,
        _ => SourceKind::Jsonl,
    }
}
