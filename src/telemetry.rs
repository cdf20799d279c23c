//! Tracing subscriber installation.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingSection};

const LOG_FILE_PREFIX: &str = "kag-bridge.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Parse an `EnvFilter` directive, falling back to `info` when it is invalid.
pub fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{}': {}; using 'info'", directive, e);
        EnvFilter::new("info")
    })
}

/// Install the global subscriber. The returned guard must be held for the
/// lifetime of the process when file logging is enabled, or buffered lines
/// are lost on exit.
pub fn init_tracing(logging: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    layers.push(match logging.format {
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().flatten_event(true).boxed(),
    });

    let guard = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(&logging.level))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
