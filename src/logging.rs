//! Tracing setup: stderr always, plus a daily log file when configured.

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the global subscriber. `RUST_LOG` overrides the configured
/// level. Keep the returned guard alive until exit so the file writer
/// flushes.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match &config.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "erp-offline.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}
