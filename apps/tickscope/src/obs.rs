use std::net::SocketAddr;
use tickscope_application::config::ObservabilityConfig;

/// Overrides `observability.log_level`, e.g. `TICKSCOPE_LOG=tickscope_application=debug`.
pub const LOG_ENV: &str = "TICKSCOPE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_lowercase().as_str() {
            "" | "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "observability.log_format: unsupported '{other}' (expected text|json)"
            )),
        }
    }
}

/// Logging and exporter settings after the CLI and environment overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observability {
    pub filter: String,
    pub format: LogFormat,
    pub metrics_addr: Option<SocketAddr>,
}

pub fn resolve(
    config: Option<&ObservabilityConfig>,
    env_filter: Option<String>,
    cli_metrics_addr: Option<&str>,
) -> Result<Observability, String> {
    let defaults = ObservabilityConfig::default();
    let config = config.unwrap_or(&defaults);

    let filter = env_filter
        .filter(|v| !v.trim().is_empty())
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let format = LogFormat::parse(config.log_format.as_deref().unwrap_or("text"))?;
    let metrics_addr = cli_metrics_addr
        .or(config.metrics_addr.as_deref())
        .map(|raw| {
            raw.trim()
                .parse::<SocketAddr>()
                .map_err(|err| format!("metrics address '{raw}' (expected host:port): {err}"))
        })
        .transpose()?;

    Ok(Observability {
        filter,
        format,
        metrics_addr,
    })
}

/// Installs the global subscriber. stdout carries the command's JSON result, so logs go to
/// stderr.
pub fn init_tracing(obs: &Observability) -> Result<(), String> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(&obs.filter)
        .map_err(|err| format!("invalid log filter '{}': {err}", obs.filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match obs.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

#[cfg(feature = "prometheus")]
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<(), String> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let Some(addr) = addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| format!("failed to serve tickscope metrics on {addr}: {err}"))?;
    tracing::info!(metrics_addr = %addr, "prometheus exporter listening");
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<(), String> {
    match addr {
        Some(addr) => Err(format!(
            "metrics address {addr} given but tickscope was built without the `prometheus` feature"
        )),
        None => Ok(()),
    }
}
