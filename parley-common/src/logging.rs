//! Logging setup for the relay.
//!
//! HTTP plumbing crates are pinned to `warn` so per-update spans stay
//! readable. `RUST_LOG` overrides everything.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Library targets quieted to `warn`.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tokio_util",
    "tower_http",
];

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, ANSI colored.
    Pretty,
    /// One JSON object per line, with span context. Closed spans are logged
    /// so each update's duration is visible.
    Json,
}

impl LogFormat {
    /// Anything other than `json` is treated as pretty.
    pub fn parse(format: &str) -> Self {
        if format.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

fn filter_directives(log_level: &str) -> String {
    NOISY_MODULES
        .iter()
        .fold(log_level.to_string(), |mut acc, module| {
            acc.push(',');
            acc.push_str(module);
            acc.push_str("=warn");
            acc
        })
}

fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level)))
}

/// Install the global subscriber. Later calls are no-ops.
///
/// * `log_level` - base level (trace, debug, info, warn, error)
/// * `log_format` - `json` or `pretty`
pub fn init_logging(log_level: &str, log_format: &str) {
    let format = LogFormat::parse(log_format);
    let registry = tracing_subscriber::registry().with(build_filter(log_level));

    let installed = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_ansi(true).with_target(true))
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(log_level = %log_level, format = ?format, "Logging initialized");
    }
}

/// Trace id attached to each processed update's span.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
