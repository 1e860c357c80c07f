//! Tracing initialisation.
//!
//! Diagnostics go to the terminal and, when a session directory is given
//! and `log_file` is enabled, to `logfile.log` inside it as well.
//! `RUST_LOG` overrides the configured level.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{AppResult, HalError};

/// Name of the log file written into a session directory.
pub const LOG_FILE_NAME: &str = "logfile.log";

type FilteredRegistry = tracing_subscriber::layer::Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn open_log_file(dir: &Path) -> AppResult<(File, PathBuf)> {
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Installs the global subscriber.
///
/// Returns the log file path when one is written.
///
/// # Errors
/// [`HalError::Io`] if the log file cannot be opened,
/// [`HalError::ConfigValidation`] if a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig, session_dir: Option<&Path>) -> AppResult<Option<PathBuf>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.json {
        layers.push(fmt::layer().json().with_target(true).boxed());
    } else {
        layers.push(fmt::layer().with_target(true).boxed());
    }

    let mut log_path = None;
    if let (true, Some(dir)) = (config.log_file, session_dir) {
        let (file, path) = open_log_file(dir)?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
        log_path = Some(path);
    }

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(layers)
        .try_init()
        .map_err(|e| HalError::ConfigValidation(format!("tracing already initialised: {}", e)))?;

    if let Some(path) = &log_path {
        tracing::info!("Logging to {}", path.display());
    }
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_created_in_session_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_, path) = open_log_file(dir.path()).unwrap();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), LOG_FILE_NAME);
    }
}
