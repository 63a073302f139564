//! Tracing setup: console output on stderr, plus daily-rolling files when a
//! log directory is configured. `RUST_LOG` overrides the configured level.

use crate::config::LogConfig;
use std::fs;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Keeps the background file writer alive; drop it last.
pub struct LogGuard {
    file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn writes_to_file(&self) -> bool {
        self.file_guard.is_some()
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Installs the global subscriber. A second call keeps the first subscriber.
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_writer(std::io::stderr);

    let mut file_error = None;
    let (file_layer, file_guard) = match &config.file_dir {
        Some(dir) => match fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "ftp-turbo.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                    .with_ansi(false)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                file_error = Some(e);
                (None, None)
            }
        },
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if let Some(e) = file_error {
        warn!(dir = ?config.file_dir, "cannot create log directory, logging to console only: {}", e);
    }
    if installed {
        debug!(level = %config.level, file_dir = ?config.file_dir, "logging initialized");
    }

    LogGuard { file_guard }
}
