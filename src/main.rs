mod commands;
mod config;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Inspect and reconcile an offline resource cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Database name to open
  #[arg(short, long)]
  database: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Set up logging. The guard must live until exit so buffered lines are flushed.
fn init_tracing(log: &config::LogConfig) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_env("RESCACHE_LOG").or_else(|_| EnvFilter::try_new(&log.level))?;

  match &log.file {
    Some(path) => {
      let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
      let file_name = path
        .file_name()
        .ok_or_else(|| color_eyre::eyre::eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(dir.unwrap_or(std::path::Path::new(".")), file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(name) = args.database {
    config::Config {
      database: config::DatabaseConfig {
        name,
        ..config.database
      },
      ..config
    }
  } else {
    config
  };

  let _guard = init_tracing(&config.log)?;

  commands::run(args.command, &config).await
}
