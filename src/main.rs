mod app;
mod cache;
mod config;
mod control;
mod lifecycle;
mod network;
mod router;
mod status;
mod strategy;
mod telemetry;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mtc-proxy")]
#[command(about = "Offline-aware caching proxy for a single web origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mtc-proxy/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest for the configured version
  Install,
  /// Send a request through the proxy
  Fetch {
    /// Absolute URL, or a path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// URL of the page that issued the request
    #[arg(short, long)]
    referrer: Option<String>,
    /// Extra request header, as 'Name: value'
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Post a raw control message, e.g. '{"type":"VERSION"}'
  Control { json: String },
  /// Print the active version
  Version,
  /// Delete all cached data and re-precache
  ClearCache,
  /// Promote a waiting version
  Activate,
  /// List stored cache generations
  Generations,
  /// Probe the health endpoint
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _guard = telemetry::init(&config.logging)?;

  let app = app::App::new(config)?;
  match args.command {
    Command::Install => app.install().await,
    Command::Fetch {
      url,
      method,
      referrer,
      headers,
      data,
    } => {
      app
        .fetch(app::FetchArgs {
          url,
          method,
          referrer,
          headers,
          data,
        })
        .await
    }
    Command::Control { json } => app.control(&json).await,
    Command::Version => app.version().await,
    Command::ClearCache => app.clear_cache().await,
    Command::Activate => app.activate().await,
    Command::Generations => app.generations(),
    Command::Status => app.status().await,
  }
}
