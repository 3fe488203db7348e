//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Environment variable holding a filter directive, e.g. `offgrid=trace`.
pub const LOG_ENV: &str = "OFFGRID_LOG";

fn default_directive(verbose: bool) -> &'static str {
  if verbose {
    "offgrid=debug"
  } else {
    "offgrid=info"
  }
}

/// Install the global subscriber: a daily-rolling file under the data
/// directory, plus stderr when `verbose`. Keep the returned guard alive
/// until exit or buffered lines are lost.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "offgrid.log"));

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

  let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .without_time()
  });

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
