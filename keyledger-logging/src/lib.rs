//! Structured logging setup for keyledger services

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line (production)
    Json,
    /// Human-readable lines (development)
    Console,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Console
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging for a keyledger service
///
/// `RUST_LOG` overrides `default_level` when set. Safe to call more than
/// once: later calls leave the first subscriber in place.
pub fn init_logging(service_name: &str, default_level: &str, format: LogFormat) {
    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter(default_level))
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Console => tracing_subscriber::registry()
            .with(env_filter(default_level))
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };

    if result.is_ok() {
        tracing::info!(
            service = service_name,
            format = ?format,
            "Logging initialized"
        );
    }
}
