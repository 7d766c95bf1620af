//!
//! src/logging.rs
//!
//! Installs the global subscriber. Events go to stdout through a
//! non-blocking writer as JSON lines or human readable text
//!

use tracing_appender::non_blocking;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::BridgeError;

/// Flushes buffered events when dropped; keep it alive in `main`
pub struct LoggingGuard(tracing_appender::non_blocking::WorkerGuard);

fn filter(cfg: &LoggingConfig) -> EnvFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(cfg.filter_directives.clone()))
}

pub fn init_logging(cfg: &LoggingConfig) -> Result<LoggingGuard, BridgeError> {
    let (writer, guard) = non_blocking(std::io::stdout());
    let time = fmt::time::UtcTime::rfc_3339();

    let base = fmt::layer()
        .with_writer(writer)
        .with_timer(time)
        .with_target(cfg.include_target)
        .with_file(cfg.include_file_line)
        .with_line_number(cfg.include_file_line);

    let registry = tracing_subscriber::registry()
        .with(filter(cfg))
        .with(ErrorLayer::default());

    let installed = match cfg.format {
        LogFormat::Json => registry
            .with(base
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(base.with_ansi(cfg.with_ansi))
            .try_init()
    };
    installed.map_err(|e| BridgeError::Config(format!("logging already initialized: {e}")))?;

    Ok( LoggingGuard(guard) )
}
