use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use internsync::client::HttpClient;
use internsync::config::Config;
use internsync::dashboard::{Dashboard, Session};
use internsync::model::Role;

#[derive(Parser, Debug)]
#[command(name = "internsync")]
#[command(about = "Load an internship dashboard through the sync layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/internsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User to load the dashboard for
  #[arg(short, long)]
  username: String,

  /// intern, mentor, tech_lead or admin
  #[arg(short, long, default_value = "intern")]
  role: Role,

  /// College scope for tech leads
  #[arg(long)]
  college: Option<String>,

  /// Keep polling the server's sync queue until interrupted
  #[arg(short, long)]
  watch: bool,
}

/// Log to stderr, or to a daily file when a log directory is configured.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "internsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(config.log_dir.as_deref());

  let client = Arc::new(HttpClient::new(&config.api, Config::get_api_token())?);
  let session = Session {
    username: args.username,
    role: args.role,
    college: args.college,
  };
  let dashboard = Dashboard::new(&config, session, client.clone(), client);

  dashboard.open().await?;
  for handle in dashboard.preload_inactive() {
    if let Err(e) = handle.await {
      warn!(error = %e, "preload task ended abnormally");
    }
  }

  let tabs = dashboard.tabs();
  for id in dashboard.tab_ids() {
    match (tabs.data(id), tabs.error(id)) {
      (_, Some(e)) => warn!(tab = id, error = %e, "tab failed to load"),
      (Some(data), None) => info!(tab = id, "{}", data.summary()),
      (None, None) => info!(tab = id, "no data"),
    }
  }

  if args.watch {
    let poller = dashboard.start_status_polling();
    tokio::signal::ctrl_c().await?;
    poller.cancel();

    let status = dashboard.sync().status();
    info!(queue_size = status.queue_size, "stopped polling");
  }

  let stats = dashboard.cache().stats();
  info!(hits = stats.hits, misses = stats.misses, joined = stats.joined, "cache summary");
  Ok(())
}
