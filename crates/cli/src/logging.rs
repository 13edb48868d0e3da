//! Tracing setup: a daily-rotated log file under the state directory plus
//! warnings (or everything, with `--verbose`) on stderr.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use autosync_core::SyncConfig;

/// `RUST_LOG` wins over the configured level.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(config: &SyncConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = config.sync.log_level.as_str();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();
    let stderr_layer = if verbose {
        stderr_layer.with_filter(filter(level)).boxed()
    } else {
        stderr_layer.with_filter(LevelFilter::WARN).boxed()
    };

    let log_dir = config.state_dir().join("logs");
    let appender = std::fs::create_dir_all(&log_dir).ok().and_then(|()| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("autosync")
            .filename_suffix("log")
            .build(&log_dir)
            .ok()
    });

    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter(level));
            (Some(layer), Some(guard))
        }
        None => {
            eprintln!("warning: cannot write logs to {}", log_dir.display());
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}
