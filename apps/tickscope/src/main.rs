mod commands;
mod infra;
mod obs;

use clap::{Parser, Subcommand};
use commands::Command;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tickscope")]
#[command(about = "Streaming crypto indicators and movers rankings", version, arg_required_else_help = true)]
#[command(
    after_help = "Examples:\n  tickscope run --config platform/ops/configs/sample.toml\n  tickscope run --config platform/ops/configs/sample.toml --dry-run\n  tickscope validate --config platform/ops/configs/sample.toml\n  tickscope migrate --config platform/ops/configs/sample.toml\n  tickscope replay --config platform/ops/configs/sample.toml --input ticks.jsonl --step 30s\n"
)]
struct Cli {
    /// Prometheus listen address (host:port). Overrides observability.metrics_addr.
    #[arg(long, global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the evaluation and ranking cadences until interrupted.
    Run {
        /// Config file path (TOML). If omitted, uses env TICKSCOPE_CONFIG.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write to an in-memory sink instead of the configured one.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Validate the config and print the resolved settings.
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Create the sink tables if they do not exist.
    Migrate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Replay a tick file on event time and print the final ranking.
    Replay {
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSONL or CSV tick file.
        #[arg(long)]
        input: PathBuf,
        /// Event-time step between evaluation cycles.
        #[arg(long, default_value = "30s")]
        step: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let (command, config) = match cli.command {
        CliCommand::Run { config, dry_run } => (Command::Run { dry_run }, config),
        CliCommand::Validate { config } => (Command::Validate, config),
        CliCommand::Migrate { config } => (Command::Migrate, config),
        CliCommand::Replay {
            config,
            input,
            step,
        } => (Command::Replay { input, step }, config),
    };

    let config_path = config
        .or_else(|| {
            std::env::var("TICKSCOPE_CONFIG")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| {
            eprintln!("error: missing --config and env TICKSCOPE_CONFIG is not set");
            std::process::exit(2);
        });

    let loaded = match commands::load(&config_path) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let observability = match obs::resolve(
        loaded.config.observability.as_ref(),
        std::env::var(obs::LOG_ENV).ok(),
        cli.metrics_addr.as_deref(),
    ) {
        Ok(observability) => observability,
        Err(err) => {
            eprintln!("error: invalid config: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = obs::init_tracing(&observability) {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
    if let Err(err) = obs::init_metrics(observability.metrics_addr) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    metrics::counter!("tickscope.cli.commands_total", "command" => command.name()).increment(1);
    match commands::run(command, loaded) {
        Ok(json) => {
            println!(
                "{}",
                serde_json::to_string(&json)
                    .unwrap_or_else(|_| "{\"status\":\"error\",\"error\":\"json\"}".to_string())
            );
        }
        Err(err) => {
            let code = if err.starts_with("invalid config") { 2 } else { 1 };
            eprintln!("error: {err}");
            std::process::exit(code);
        }
    }
}
