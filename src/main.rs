mod agent;
mod cache;
mod config;
mod error;
mod host;
mod logging;
mod net;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use agent::OfflineAgent;
use cache::{CacheStorage, Request, SqliteStorage};
use host::ServiceHost;
use net::HttpNetwork;

#[derive(Parser, Debug)]
#[command(name = "brewcache")]
#[command(about = "Cache-first offline agent for the brewcalc web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/brewcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// URL the worker controls
  #[arg(long, global = true)]
  scope: Option<String>,

  /// Cache database path
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the asset list and activate this version
  Install,
  /// Activate the installed version and delete stale caches
  Activate,
  /// Load a resource through the agent
  Fetch {
    /// Path relative to the scope, e.g. ./index.html
    path: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List cache buckets
  Buckets {
    /// Show every entry
    #[arg(short, long)]
    verbose: bool,
  },
}

type Agent = OfflineAgent<SqliteStorage, HttpNetwork>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, command line wins
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(scope) = args.scope {
    config.scope = scope;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let _log_guard = logging::init(config.log_dir.as_deref())?;

  let scope = config.scope_url()?;
  let storage = Arc::new(SqliteStorage::open(config.database.as_deref())?);
  let network = Arc::new(HttpNetwork::new(scope.clone()));
  let agent = Arc::new(OfflineAgent::new(
    scope.clone(),
    config.manifest(),
    Arc::clone(&storage),
    Arc::clone(&network),
  ));
  let host = ServiceHost::new(network);

  match args.command {
    Command::Install => install(&host, agent).await,
    Command::Activate => activate(&host, agent, &storage).await,
    Command::Fetch {
      path,
      method,
      output,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let url = scope
        .join(&path)
        .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
      fetch(&host, agent, &storage, Request::new(method, url), output).await
    }
    Command::Buckets { verbose } => buckets(&agent, &storage, verbose),
  }
}

async fn install(host: &ServiceHost<HttpNetwork>, agent: Arc<Agent>) -> Result<()> {
  let cache_name = agent.manifest().cache_name();
  let state = host.register(agent).await?;
  println!("{}: {}", cache_name, state);
  Ok(())
}

async fn activate(
  host: &ServiceHost<HttpNetwork>,
  agent: Arc<Agent>,
  storage: &SqliteStorage,
) -> Result<()> {
  let cache_name = agent.manifest().cache_name();
  if !storage.has(&cache_name)? {
    return Err(eyre!(
      "{} is not installed; run `brewcache install` first",
      cache_name
    ));
  }

  host.restore_installed(agent);
  host.activate_waiting().await?;
  println!("{}: activated", cache_name);
  Ok(())
}

async fn fetch(
  host: &ServiceHost<HttpNetwork>,
  agent: Arc<Agent>,
  storage: &SqliteStorage,
  request: Request,
  output: Option<PathBuf>,
) -> Result<()> {
  // A present bucket means this version was installed in an earlier run
  if storage.has(&agent.manifest().cache_name())? {
    host.resume(agent);
  } else {
    host.register(agent).await?;
  }

  let client = host.open_client();
  let result = host.fetch(client, request).await;
  // Let background refreshes finish before the process exits
  host.settle().await;
  let response = result?;

  info!(
    url = %response.url,
    status = response.status,
    content_type = response.header("content-type").unwrap_or("-"),
    bytes = response.body.len(),
    "loaded"
  );

  match output {
    Some(path) => std::fs::write(&path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout().write_all(&response.body)?,
  }
  Ok(())
}

fn buckets(agent: &Agent, storage: &SqliteStorage, verbose: bool) -> Result<()> {
  let current = agent.manifest().cache_name();

  for name in storage.keys()? {
    let marker = if name == current { "*" } else { " " };
    let entries = storage.entries(&name)?;
    println!("{} {} ({} entries)", marker, name, entries.len());

    if verbose {
      for entry in entries {
        println!(
          "    {} {} {}",
          entry.status,
          entry.url,
          entry.cached_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
  }

  Ok(())
}
