//! Subcommands and their handlers.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use offgrid::api::{ApiClient, MutationOutcome};
use offgrid::cache::{register_cache_worker, WorkerHandle, WorkerState};
use offgrid::config::Config;
use offgrid::credentials::{CredentialStore, Strategy};
use offgrid::http::{HttpFetcher, Request};
use offgrid::monitor::{ConnectivityProbe, NetworkMonitor};
use offgrid::queue::{Method, QueueStore, SqliteQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// GET a URL through the cache worker
  Fetch { url: String },

  /// Send a mutation, queueing it if the server is unreachable
  Send {
    /// POST, PUT, PATCH or DELETE
    method: String,
    /// Path relative to api_base_url
    endpoint: String,
    /// JSON request body
    #[arg(short, long)]
    payload: Option<String>,
  },

  /// Inspect or empty the mutation queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },

  /// Replay queued mutations
  Sync {
    /// Keep running and replay whenever connectivity returns
    #[arg(short, long)]
    watch: bool,
  },

  /// Manage the stored bearer token
  Token {
    #[command(subcommand)]
    action: TokenAction,
  },

  /// Manage cached map tiles
  Tiles {
    #[command(subcommand)]
    action: TileAction,
  },

  /// Cache maintenance
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
pub enum QueueAction {
  /// List pending mutations in replay order
  List,
  /// Drop every pending mutation
  Clear,
}

#[derive(Subcommand, Debug)]
pub enum TokenAction {
  /// Store a token (default: $OFFGRID_TOKEN)
  Store { token: Option<String> },
  /// Print the stored token
  Show,
  /// Forget the stored token
  Clear,
  /// Print the active storage strategy
  Strategy,
}

#[derive(Subcommand, Debug)]
pub enum TileAction {
  /// Download a tile into the map bucket
  Prefetch { url: String },
  /// Whether a tile is cached
  Check { url: String },
  /// Delete every map bucket
  Clear,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
  /// Delete buckets left over from older cache versions
  Purge,
}

pub async fn execute(command: Command, config: &Config) -> Result<()> {
  match command {
    Command::Fetch { url } => fetch(config, &url).await,
    Command::Send {
      method,
      endpoint,
      payload,
    } => send(config, &method, &endpoint, payload.as_deref()).await,
    Command::Queue { action } => queue(action),
    Command::Sync { watch } => sync(config, watch).await,
    Command::Token { action } => token(config, action).await,
    Command::Tiles { action } => tiles(config, action).await,
    Command::Cache {
      action: CacheAction::Purge,
    } => {
      let worker = worker(config).await?;
      let deleted = worker.purge().await?;
      if deleted.is_empty() {
        println!("No stale buckets");
      }
      for name in deleted {
        println!("Deleted {}", name);
      }
      Ok(())
    }
  }
}

async fn worker(config: &Config) -> Result<WorkerHandle> {
  let handle = register_cache_worker(config).await?;
  if handle.ready().await == WorkerState::Redundant {
    warn!("Cache worker could not install, serving from existing buckets only");
  }
  Ok(handle)
}

fn api_client(config: &Config, queue: Arc<SqliteQueue>) -> Result<ApiClient<SqliteQueue>> {
  ApiClient::new(config, CredentialStore::from_config(config)?, queue)
}

async fn fetch(config: &Config, url: &str) -> Result<()> {
  let worker = worker(config).await?;
  let result = worker.fetch(Request::get(url)?).await?;

  println!("{} ({})", result.data.status, result.source);
  if let Some(cached_at) = result.cached_at {
    println!("cached at {}", cached_at.to_rfc3339());
  }
  println!();
  println!("{}", String::from_utf8_lossy(&result.data.body));

  // Let background cache writes land before the process exits
  worker.settle().await
}

async fn send(config: &Config, method: &str, endpoint: &str, payload: Option<&str>) -> Result<()> {
  let method: Method = method.parse()?;
  let payload: Option<serde_json::Value> = payload
    .map(serde_json::from_str)
    .transpose()
    .map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;

  let api = api_client(config, Arc::new(SqliteQueue::open()?))?;
  match api.mutate(endpoint, method, payload).await? {
    MutationOutcome::Sent { status, body } => {
      println!("{}", status);
      if !body.is_empty() {
        println!("{}", body);
      }
    }
    MutationOutcome::Queued(item) => {
      println!("Offline: queued {} {} as {}", item.method, item.endpoint, item.id);
    }
  }
  Ok(())
}

fn queue(action: QueueAction) -> Result<()> {
  let queue = SqliteQueue::open()?;
  match action {
    QueueAction::List => {
      let items = queue.peek_all()?;
      if items.is_empty() {
        println!("Queue is empty");
      }
      for item in items {
        let created = chrono::DateTime::from_timestamp_millis(item.created_at)
          .map(|at| at.to_rfc3339())
          .unwrap_or_else(|| item.created_at.to_string());
        println!("{}  {:<6} {}  {}", created, item.method, item.endpoint, item.id);
      }
    }
    QueueAction::Clear => {
      let pending = queue.pending_count()?;
      queue.clear()?;
      println!("Dropped {} pending mutations", pending);
    }
  }
  Ok(())
}

async fn sync(config: &Config, watch: bool) -> Result<()> {
  let queue = Arc::new(SqliteQueue::open()?);
  let api = api_client(config, Arc::clone(&queue))?;

  if !watch {
    let monitor = NetworkMonitor::new(queue, api, true);
    if let Some(report) = monitor.sync_now().await? {
      println!(
        "Replayed {} of {}, {} still pending",
        report.replayed, report.drained, report.pending
      );
    }
    return Ok(());
  }

  let probe = ConnectivityProbe::new(
    Arc::new(HttpFetcher::new()?),
    config.probe_url(),
    Duration::from_secs(config.monitor.probe_interval_secs),
  )?;
  let online = probe.is_reachable().await;
  let probe = probe.assume(online);

  let monitor = Arc::new(NetworkMonitor::new(queue, api, online));
  monitor.subscribe(|status| {
    let state = if status.online { "online" } else { "offline" };
    println!("{}, {} pending", state, status.pending);
  });

  let (tx, rx) = mpsc::channel(8);
  let probing = tokio::spawn(probe.run(tx));
  info!("Watching connectivity via {}", config.probe_url());

  let mut running = tokio::spawn(Arc::clone(&monitor).run(rx));
  tokio::select! {
    result = &mut running => {
      probing.abort();
      return result.map_err(|e| eyre!("Monitor task failed: {}", e))?;
    }
    _ = tokio::signal::ctrl_c() => info!("Interrupted, finishing replay in progress"),
  }

  // Stopping the probe closes the signal channel; run then waits out its cycles
  probing.abort();
  running.await.map_err(|e| eyre!("Monitor task failed: {}", e))?
}

async fn token(config: &Config, action: TokenAction) -> Result<()> {
  let credentials = CredentialStore::from_config(config)?;
  let strategy = credentials.strategy();

  match action {
    TokenAction::Store { token } => {
      let token = match token {
        Some(token) => token,
        None => Config::get_token()?,
      };
      credentials.store_token(&token).await?;
      if strategy == Strategy::Cookie {
        println!("Cookie strategy: the server manages the session, nothing stored");
      } else {
        println!("Token stored ({})", strategy);
      }
    }
    TokenAction::Show => match credentials.read_token().await? {
      Some(token) => println!("{}", token),
      None => println!("No token stored ({})", strategy),
    },
    TokenAction::Clear => {
      credentials.clear_token().await?;
      println!("Token cleared");
    }
    TokenAction::Strategy => println!("{}", strategy),
  }
  Ok(())
}

async fn tiles(config: &Config, action: TileAction) -> Result<()> {
  let worker = worker(config).await?;
  match action {
    TileAction::Prefetch { url } => {
      worker.prefetch_tile(&url).await?;
      println!("Cached {}", url);
    }
    TileAction::Check { url } => {
      let cached = worker.is_tile_cached(&url).await?;
      println!("{}", if cached { "cached" } else { "not cached" });
    }
    TileAction::Clear => {
      let deleted = worker.clear_tile_cache().await?;
      println!("Deleted {} tile buckets", deleted.len());
    }
  }
  worker.settle().await
}
