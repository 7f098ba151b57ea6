//! # Logging
//!
//! Installs the global `tracing` subscriber described by a [`LoggingConfig`].
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.
//! Installation happens at most once per process; later calls are no-ops.

use std::fs::OpenOptions;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Returns `Ok(false)` when one was already set.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    if INSTALLED.get().is_some() {
        return Ok(false);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));
    let writer = make_writer(config)?;

    let installed = if config.json_format {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .json()
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .try_init()
            .is_ok()
    };

    let _ = INSTALLED.set(());
    if installed {
        tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    Ok(installed)
}

fn make_writer(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    let file = match (config.log_to_file, &config.log_file_path) {
        (true, Some(path)) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
                })?,
        ),
        (true, None) => {
            return Err(ProtocolError::ConfigError(
                "log_file_path must be specified when log_to_file is true".to_string(),
            ))
        }
        _ => None,
    };

    Ok(match (config.log_to_console, file) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stdout.and(Mutex::new(file))),
        (false, Some(file)) => BoxMakeWriter::new(Mutex::new(file)),
        _ => BoxMakeWriter::new(std::io::stdout),
    })
}
