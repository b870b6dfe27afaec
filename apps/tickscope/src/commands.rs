use crate::infra;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tickscope_application::config::{self, Config, SinkKind};
use tickscope_application::engine::EngineSettings;
use tickscope_application::pipeline::run_pipeline;
use tickscope_application::replay::replay;
use tickscope_domain::value_objects::duration::parse_duration_like_ms;
use tickscope_infrastructure::persistence::memory::MemoryMetricsSink;
use tokio::sync::watch;

pub enum Command {
    Run { dry_run: bool },
    Validate,
    Migrate,
    Replay { input: PathBuf, step: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::Validate => "validate",
            Command::Migrate => "migrate",
            Command::Replay { .. } => "replay",
        }
    }
}

pub struct Loaded {
    pub config: Config,
    pub config_toml: String,
    pub settings: EngineSettings,
}

/// Reads and validates the config file. Every failure here is reported as a config error.
pub fn load(path: &Path) -> Result<Loaded, String> {
    let config = config::load_config(path).map_err(|err| format!("invalid config: {err}"))?;
    let settings = config::resolve_settings(&config)?;
    infra::validate_sink(&config)?;
    let config_toml = config::to_toml_pretty(&config)?;
    Ok(Loaded {
        config,
        config_toml,
        settings,
    })
}

pub fn run(command: Command, loaded: Loaded) -> Result<Value, String> {
    let _span = tracing::info_span!("command", name = command.name()).entered();
    match command {
        Command::Run { dry_run } => run_live(loaded, dry_run),
        Command::Validate => Ok(run_validate(&loaded)),
        Command::Migrate => run_migrate(&loaded.config),
        Command::Replay { input, step } => run_replay(loaded.settings, &input, &step),
    }
}

fn run_validate(loaded: &Loaded) -> Value {
    let config = &loaded.config;
    json!({
        "status": "ok",
        "mode": "validate",
        "settings": loaded.settings,
        "source": {
            "kind": config.source.kind,
            "path": config.source.path,
            "follow": config.source.follow.unwrap_or(false),
        },
        "sink": {
            "kind": config.sink.kind,
            "metrics_table": config.sink.metrics_table(),
            "gainers_table": config.sink.gainers_table(),
            "losers_table": config.sink.losers_table(),
        },
        "config_toml": loaded.config_toml,
    })
}

fn run_migrate(config: &Config) -> Result<Value, String> {
    if config.sink.kind != SinkKind::Postgres {
        return Err("migrate requires sink.kind = \"postgres\"".to_string());
    }
    let sink = infra::build_postgres_sink(config)?;
    sink.migrate()?;
    let tables = sink.tables();
    Ok(json!({
        "status": "ok",
        "mode": "migrate",
        "tables": [tables.metrics, tables.gainers, tables.losers],
    }))
}

fn run_live(loaded: Loaded, dry_run: bool) -> Result<Value, String> {
    let sink = if dry_run {
        tracing::info!("dry run: writing to the in-memory sink");
        Arc::new(MemoryMetricsSink::new()) as infra::SharedSink
    } else {
        infra::build_sink(&loaded.config)?
    };
    let source = infra::build_source(&loaded.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("unable to start async runtime: {err}"))?;
    let summary = runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupt received; finishing in-flight cycles");
                    let _ = shutdown_tx.send(true);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to listen for ctrl-c");
                    // Keep the sender alive; dropping it would stop the pipeline.
                    std::future::pending::<()>().await;
                }
            }
        });
        run_pipeline(loaded.settings, source, sink, shutdown_rx).await
    })?;

    Ok(json!({
        "status": "ok",
        "mode": "run",
        "dry_run": dry_run,
        "summary": summary,
    }))
}

fn run_replay(settings: EngineSettings, input: &Path, step: &str) -> Result<Value, String> {
    let step_ms = parse_duration_like_ms(step).map_err(|err| format!("invalid --step: {err}"))?;
    if step_ms <= 0 {
        return Err(format!("invalid --step: must be > 0 (got {step:?})"));
    }
    let mut source = infra::open_source(infra::source_kind_for(input), input, false)?;
    let sink = Arc::new(MemoryMetricsSink::new());
    let summary = replay(settings, source.as_mut(), sink.clone(), step_ms)?;

    Ok(json!({
        "status": "ok",
        "mode": "replay",
        "input": input.display().to_string(),
        "step_ms": step_ms,
        "rows_written": sink.row_count(),
        "summary": summary,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("tickscope_{name}_{}_{now}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_config(dir: &Path, extra: &str) -> PathBuf {
        let path = dir.join("config.toml");
        let contents = format!(
            r#"
[pipeline]
eval_interval = "30s"
ranking_interval = "5m"

[indicators]
ma_period = 5
retention = "6m"

[source]
kind = "jsonl"
path = "{}"

[sink]
kind = "memory"
{extra}
"#,
            dir.join("ticks.jsonl").display()
        );
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn validate_reports_resolved_settings() {
        let dir = temp_dir("validate");
        let loaded = load(&write_config(&dir, "")).unwrap();
        let out = run(Command::Validate, loaded).unwrap();
        assert_eq!(out["status"], "ok");
        assert_eq!(out["settings"]["retention_ms"], 360_000);
        assert_eq!(out["settings"]["ranking_metric"], "change_1min");
        assert_eq!(out["sink"]["metrics_table"], "crypto_metrics");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn bad_table_name_is_a_config_error() {
        let dir = temp_dir("tables");
        let err = load(&write_config(&dir, "metrics_table = \"x; drop\"")).err().unwrap();
        assert!(err.starts_with("invalid config"), "{err}");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn migrate_refuses_memory_sink() {
        let dir = temp_dir("migrate");
        let loaded = load(&write_config(&dir, "")).unwrap();
        let err = run(Command::Migrate, loaded).unwrap_err();
        assert!(err.contains("postgres"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn replay_prints_final_ranking() {
        let dir = temp_dir("replay");
        let input = dir.join("ticks.jsonl");
        let lines = [
            r#"{"id":"bitcoin","symbol":"BTC","price":100,"timestamp":1704067200}"#,
            r#"{"id":"ethereum","symbol":"ETH","price":100,"timestamp":1704067200}"#,
            r#"{"id":"bitcoin","symbol":"BTC","price":105,"timestamp":1704067260}"#,
            r#"{"id":"ethereum","symbol":"ETH","price":97,"timestamp":1704067260}"#,
        ];
        std::fs::write(&input, lines.join("\n")).unwrap();
        let loaded = load(&write_config(&dir, "")).unwrap();

        let out = run(
            Command::Replay {
                input,
                step: "30s".to_string(),
            },
            loaded,
        )
        .unwrap();
        assert_eq!(out["summary"]["evaluation_cycles"], 3);
        assert_eq!(out["summary"]["final_ranking"]["gainers"][0]["symbol"], "BTC");
        assert_eq!(out["summary"]["final_ranking"]["losers"][0]["symbol"], "ETH");
        assert_eq!(out["rows_written"], 6);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn replay_rejects_zero_step() {
        let dir = temp_dir("step");
        let loaded = load(&write_config(&dir, "")).unwrap();
        let err = run(
            Command::Replay {
                input: dir.join("ticks.jsonl"),
                step: "0s".to_string(),
            },
            loaded,
        )
        .unwrap_err();
        assert!(err.contains("--step"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
