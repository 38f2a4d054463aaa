//! Tracing subscriber setup for the daemon.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logging options collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Debug level instead of info (ignored when `RUST_LOG` is set).
    pub verbose: bool,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Also write a daily-rotated log file into this directory.
    pub log_dir: Option<PathBuf>,
}

/// Build the level filter: `RUST_LOG` wins, otherwise info or debug.
pub fn build_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held
/// for the lifetime of the process.
pub fn init_logging(options: &LogOptions) -> Option<WorkerGuard> {
    let filter = build_filter(options.verbose);

    let (file_writer, guard) = match &options.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pingtestd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if options.json {
        let file_layer = file_writer.map(|w| fmt::layer().json().with_writer(w).with_ansi(false));
        let _ = registry
            .with(fmt::layer().json())
            .with(file_layer)
            .try_init();
    } else {
        let file_layer = file_writer.map(|w| fmt::layer().with_writer(w).with_ansi(false));
        let _ = registry.with(fmt::layer()).with(file_layer).try_init();
    }

    guard
}
