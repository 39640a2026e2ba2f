use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use techtrack::app::{App, Command};
use techtrack::config::Config;

#[derive(Parser, Debug)]
#[command(name = "techtrack")]
#[command(about = "Track what you are learning, online or offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/techtrack/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Act as this user instead of the last active one
  #[arg(short, long, global = true)]
  user: Option<String>,

  #[command(subcommand)]
  command: Command,
}

/// Log to a daily rolling file so stdout stays clean for command output.
fn init_logging() -> Option<WorkerGuard> {
  let dir = dirs::data_dir()?.join("techtrack").join("logs");
  let appender = tracing_appender::rolling::daily(dir, "techtrack.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init();

  Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let app = App::new(&config, args.user.as_deref())?;
  app.run(args.command).await?;

  Ok(())
}
