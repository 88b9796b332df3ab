//! Structured logging.
//!
//! # Design Decisions
//! - `tracing` everywhere; this module only installs the subscriber
//! - `RUST_LOG` overrides the configured level, `-v` forces `debug`
//! - Text or JSON lines, to stderr or appended to `log_file` (stderr is gone
//!   once the process daemonizes)

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::ObservabilityConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown log format {0:?} (expected \"text\" or \"json\")")]
    Format(String),

    #[error("failed to install log subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Filter directive for the given settings.
pub fn filter_directive(config: &ObservabilityConfig, verbose: bool) -> String {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    format!("mqttd={level},tower_http={level},warn")
}

/// Install the global subscriber.
pub fn init(config: &ObservabilityConfig, verbose: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config, verbose)));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match (&config.log_file, config.log_format.as_str()) {
        (None, "text") => tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed(),
        (None, "json") => tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (Some(path), format @ ("text" | "json")) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            let writer = Mutex::new(file);
            if format == "json" {
                tracing_subscriber::fmt::layer().json().with_ansi(false).with_writer(writer).boxed()
            } else {
                tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer).boxed()
            }
        }
        (_, other) => return Err(LoggingError::Format(other.to_string())),
    };

    tracing_subscriber::registry().with(layer).with(filter).try_init()?;
    Ok(())
}
