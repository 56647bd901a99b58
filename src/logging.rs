use std::env;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

const FILTER_VAR: &str = "WATERMARK_LOG";
const FORMAT_VAR: &str = "WATERMARK_LOG_FORMAT";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Compact,
}

/// Installs the global subscriber. Logs go to stderr so stdout stays free
/// for progress lines and the final JSON report.
pub fn init(verbose: bool) {
    let filter = build_filter(verbose);
    let registry = Registry::default().with(filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let result = match parse_format(env::var(FORMAT_VAR).ok().as_deref()) {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env::var(FILTER_VAR).or_else(|_| env::var("RUST_LOG")) {
        Ok(value) => EnvFilter::new(value),
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("info"),
    }
}

fn parse_format(value: Option<&str>) -> LogFormat {
    match value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Compact,
    }
}
