//! Observability infrastructure for velo.
//!
//! Structured logging with consistent spans. Every pipeline step runs inside
//! a span carrying the partition and run ID so a month's logs can be pulled
//! out of a shared sink.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}' (expected json or pretty)")),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `velo_flow=debug`)
///
/// # Example
///
/// ```rust
/// use velo_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for pipeline operations with standard fields.
///
/// # Example
///
/// ```rust
/// use velo_core::observability::pipeline_span;
///
/// let span = pipeline_span("reload_trips", "2025-01", "01JD5X0000000000000000000");
/// let _guard = span.enter();
/// // ... reload the partition
/// ```
#[must_use]
pub fn pipeline_span(operation: &str, partition: &str, run_id: &str) -> Span {
    tracing::info_span!(
        "pipeline",
        op = operation,
        partition = partition,
        run_id = run_id,
    )
}

/// Creates a span for a single transformation model.
#[must_use]
pub fn model_span(model: &str, materialization: &str) -> Span {
    tracing::info_span!("model", model = model, materialization = materialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn pipeline_span_creates_span() {
        let span = pipeline_span("fetch", "2025-01", "run_123");
        let _guard = span.enter();
        tracing::info!("message in pipeline span");
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
