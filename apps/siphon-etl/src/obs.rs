use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

pub fn parse_log_format(raw: &str) -> Result<LogFormat, String> {
    match raw.trim().to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format '{other}' (expected text or json)")),
    }
}

/// Env SIPHON_LOG overrides the CLI level, so operators can widen the filter
/// on a running deployment without touching its invocation.
pub fn init_tracing(log_level: &str, log_format: &str) -> Result<(), String> {
    let format = parse_log_format(log_format)?;
    let filter = std::env::var("SIPHON_LOG").unwrap_or_else(|_| log_level.to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(filter)
        .map_err(|err| format!("invalid log filter: {err}"))?;

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

#[cfg(feature = "prometheus")]
fn parse_metrics_addr(raw: &str) -> Result<SocketAddr, String> {
    raw.parse()
        .map_err(|err| format!("invalid --metrics-addr (expected host:port): {err}"))
}

#[cfg(feature = "prometheus")]
pub fn init_metrics(metrics_addr: Option<&str>) -> Result<Option<SocketAddr>, String> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let Some(raw) = metrics_addr else {
        return Ok(None);
    };
    let addr = parse_metrics_addr(raw)?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| format!("failed to install prometheus exporter: {err}"))?;

    tracing::info!(metrics_addr = %addr, "serving prometheus metrics");
    Ok(Some(addr))
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(metrics_addr: Option<&str>) -> Result<Option<SocketAddr>, String> {
    if metrics_addr.is_some() {
        return Err("metrics exporter requires siphon-etl feature `prometheus`".to_string());
    }
    Ok(None)
}
