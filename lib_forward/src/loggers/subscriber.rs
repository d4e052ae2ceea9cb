//! # Subscriber Setup
//!
//! Installs the global `tracing` subscriber for the broker binaries.
//!
//! ## Layers:
//!
//! - **Filter**: `RUST_LOG` when set, otherwise directives derived from the
//!   verbosity level (see [`verbosity_directives`]).
//! - **Console**: human-readable `fmt` output.
//! - **File** (optional): daily rolling JSON lines written through a
//!   non-blocking appender. The returned guard must live as long as logging.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Highest meaningful verbosity level.
pub const MAX_VERBOSITY: u8 = 5;

/// Errors while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory could not be created.
    #[error("failed to create log directory: {0}")]
    LogDir(#[from] io::Error),

    /// A filter directive did not parse.
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// # Log Options
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Verbosity level, 0 to [`MAX_VERBOSITY`]. Larger values are clamped.
    pub verbosity: u8,
    /// When set, a daily rolling JSON log is written here as well.
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the rolling log.
    pub file_prefix: String,
    /// Colored console output.
    pub ansi: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            verbosity: 0,
            log_dir: None,
            file_prefix: "server_forward".to_string(),
            ansi: true,
        }
    }
}

/// # Verbosity Directives
///
/// Maps a verbosity level to `EnvFilter` directives. Each level switches on one
/// diagnostic area; it does not include the levels below it.
///
/// | level | area |
/// |-------|------|
/// | 0, 1  | `info` only |
/// | 2     | allocation (peer pool) |
/// | 3     | socket input (event loop) |
/// | 4     | parser (framer) |
/// | 5     | everything at `trace` |
pub fn verbosity_directives(verbosity: u8) -> &'static str {
    match verbosity.min(MAX_VERBOSITY) {
        0 | 1 => "info",
        2 => "info,lib_forward::core::pool=debug",
        3 => "info,lib_forward::core::event_loop=trace",
        4 => "info,lib_forward::core::framer=trace",
        _ => "trace",
    }
}

/// Builds the filter: `RUST_LOG` when set and valid, the verbosity mapping
/// otherwise.
pub fn build_filter(verbosity: u8) -> Result<EnvFilter, LoggerError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(verbosity_directives(verbosity))?),
    }
}

/// # Setup Logging
///
/// Installs the global `tracing` subscriber: a console layer, plus a
/// non-blocking daily rolling JSON file layer when `log_dir` is set.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the whole program.
pub fn setup_logging(options: &LogOptions) -> Result<Option<WorkerGuard>, LoggerError> {
    let filter = build_filter(options.verbosity)?;
    let console_layer = fmt::layer().with_target(true).with_ansi(options.ansi);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = rolling::daily(dir, &options.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_not_cumulative() {
        assert_eq!(verbosity_directives(0), "info");
        assert_eq!(verbosity_directives(1), "info");
        assert!(verbosity_directives(2).contains("pool=debug"));
        assert!(!verbosity_directives(3).contains("pool"));
        assert!(verbosity_directives(4).contains("framer=trace"));
        assert_eq!(verbosity_directives(5), "trace");
    }

    #[test]
    fn test_levels_above_max_are_clamped() {
        assert_eq!(verbosity_directives(9), verbosity_directives(MAX_VERBOSITY));
    }

    #[test]
    fn test_every_level_parses() {
        for level in 0..=MAX_VERBOSITY {
            assert!(EnvFilter::try_new(verbosity_directives(level)).is_ok());
        }
    }
}
