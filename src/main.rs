mod commands;

use clap::Parser;
use color_eyre::Result;
use offgrid::{config, logging};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline cache, mutation queue and token storage for a web app backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr, at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Held until exit so buffered log lines are flushed
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  commands::execute(args.command, &config).await
}
