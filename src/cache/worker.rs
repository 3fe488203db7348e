//! Background cache worker.
//!
//! The worker owns a [`CacheLayer`] inside its own tokio task. The rest of
//! the application reaches it only through a [`WorkerHandle`], which sends
//! commands over a channel and awaits replies; no state is shared.

use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::layer::CacheLayer;
use super::storage::{BucketStorage, SqliteBuckets};
use super::traits::CacheResult;
use crate::config::Config;
use crate::http::{Fetcher, HttpFetcher, Request, Response};

/// Lifecycle of a cache worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  /// Controlling requests
  Activated,
  /// Install or activation failed. Requests are still served from whatever
  /// buckets earlier sessions left behind.
  Redundant,
}

impl WorkerState {
  /// Whether the lifecycle has reached a resting state.
  pub fn is_settled(&self) -> bool {
    matches!(self, Self::Activated | Self::Redundant)
  }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
  Fetch {
    request: Request,
    reply: Reply<CacheResult<Response>>,
  },
  PrefetchTile {
    url: String,
    reply: Reply<()>,
  },
  IsTileCached {
    url: String,
    reply: Reply<bool>,
  },
  ClearTileCache {
    reply: Reply<Vec<String>>,
  },
  Purge {
    reply: Reply<Vec<String>>,
  },
  Settle {
    reply: oneshot::Sender<()>,
  },
}

/// Worker task state. Created and consumed by [`CacheWorker::spawn`].
pub struct CacheWorker<S: BucketStorage, F: Fetcher> {
  layer: CacheLayer<S, F>,
  rx: mpsc::Receiver<Command>,
  state: watch::Sender<WorkerState>,
  requests: JoinSet<()>,
}

impl<S: BucketStorage + 'static, F: Fetcher> CacheWorker<S, F> {
  /// Start the worker: install, activate, then serve commands until every
  /// handle is dropped.
  pub fn spawn(layer: CacheLayer<S, F>) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(WorkerState::Parsed);

    let worker = Self {
      layer,
      rx,
      state: state_tx,
      requests: JoinSet::new(),
    };
    tokio::spawn(worker.run());

    WorkerHandle {
      tx,
      state: state_rx,
    }
  }

  async fn run(mut self) {
    match Self::start(&self.layer, &self.state).await {
      Ok(()) => info!("Cache worker activated"),
      Err(e) => {
        warn!("Cache worker failed to start: {}", e);
        self.state.send_replace(WorkerState::Redundant);
      }
    }

    while let Some(command) = self.rx.recv().await {
      self.dispatch(command).await;
    }
    debug!("Cache worker shutting down");
  }

  async fn start(layer: &CacheLayer<S, F>, state: &watch::Sender<WorkerState>) -> Result<()> {
    state.send_replace(WorkerState::Installing);
    if layer.is_installed()? {
      debug!("Static bucket already populated, skipping install");
    } else {
      layer.install().await?;
    }
    // Take over right away instead of waiting for old pages to close
    state.send_replace(WorkerState::Installed);

    state.send_replace(WorkerState::Activating);
    layer.activate()?;
    state.send_replace(WorkerState::Activated);
    Ok(())
  }

  async fn dispatch(&mut self, command: Command) {
    // Reap finished request tasks so the set does not grow without bound
    while self.requests.try_join_next().is_some() {}

    match command {
      Command::Fetch { request, reply } => {
        let layer = self.layer.clone();
        self.requests.spawn(async move {
          let _ = reply.send(layer.handle(request).await);
        });
      }
      Command::PrefetchTile { url, reply } => {
        let layer = self.layer.clone();
        self.requests.spawn(async move {
          let _ = reply.send(layer.prefetch_tile(&url).await);
        });
      }
      Command::IsTileCached { url, reply } => {
        let _ = reply.send(self.layer.is_tile_cached(&url));
      }
      Command::ClearTileCache { reply } => {
        let _ = reply.send(self.layer.clear_tile_cache());
      }
      Command::Purge { reply } => {
        let _ = reply.send(self.layer.activate());
      }
      Command::Settle { reply } => {
        while self.requests.join_next().await.is_some() {}
        self.layer.settle().await;
        let _ = reply.send(());
      }
    }
  }
}

/// Cloneable handle to a running cache worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::Sender<Command>,
  state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
  /// Current lifecycle state.
  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Wait until the worker has activated (or given up trying).
  pub async fn ready(&self) -> WorkerState {
    let mut state = self.state.clone();
    let settled = match state.wait_for(WorkerState::is_settled).await {
      Ok(settled) => *settled,
      Err(_) => WorkerState::Redundant,
    };
    settled
  }

  /// Whether both handles talk to the same worker.
  pub fn same_worker(&self, other: &WorkerHandle) -> bool {
    self.tx.same_channel(&other.tx)
  }

  /// Route a request through the worker's caching policies.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    self
      .call(|reply| Command::Fetch { request, reply })
      .await?
  }

  pub async fn prefetch_tile(&self, url: &str) -> Result<()> {
    let url = url.to_string();
    self.call(|reply| Command::PrefetchTile { url, reply }).await?
  }

  pub async fn is_tile_cached(&self, url: &str) -> Result<bool> {
    let url = url.to_string();
    self.call(|reply| Command::IsTileCached { url, reply }).await?
  }

  pub async fn clear_tile_cache(&self) -> Result<Vec<String>> {
    self.call(|reply| Command::ClearTileCache { reply }).await?
  }

  /// Re-run the activation cleanup of stale buckets.
  pub async fn purge(&self) -> Result<Vec<String>> {
    self.call(|reply| Command::Purge { reply }).await?
  }

  /// Wait for in-flight requests and background cache writes.
  pub async fn settle(&self) -> Result<()> {
    self.call(|reply| Command::Settle { reply }).await
  }

  async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
    let (reply, response) = oneshot::channel();
    self
      .tx
      .send(command(reply))
      .await
      .map_err(|_| eyre!("Cache worker has stopped"))?;
    response
      .await
      .map_err(|_| eyre!("Cache worker dropped the request"))
  }
}

/// Holds at most one worker per registry.
pub struct WorkerRegistry {
  cell: OnceCell<WorkerHandle>,
}

impl WorkerRegistry {
  pub const fn new() -> Self {
    Self {
      cell: OnceCell::const_new(),
    }
  }

  /// Spawn the worker on first call; later calls return the same handle
  /// without running `init`.
  pub async fn register<S, F, Init>(&self, init: Init) -> Result<WorkerHandle>
  where
    S: BucketStorage + 'static,
    F: Fetcher,
    Init: FnOnce() -> Result<CacheLayer<S, F>>,
  {
    let handle = self
      .cell
      .get_or_try_init(|| async move { Ok::<_, color_eyre::Report>(CacheWorker::spawn(init()?)) })
      .await?;
    Ok(handle.clone())
  }
}

impl Default for WorkerRegistry {
  fn default() -> Self {
    Self::new()
  }
}

static REGISTRY: WorkerRegistry = WorkerRegistry::new();

/// Install the process-wide cache worker. Idempotent.
pub async fn register_cache_worker(config: &Config) -> Result<WorkerHandle> {
  REGISTRY
    .register(|| {
      let storage = SqliteBuckets::open()?;
      let fetcher = HttpFetcher::new()?;
      CacheLayer::new(storage, fetcher, config.cache.clone(), &config.origin)
    })
    .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::config::CacheConfig;
  use crate::http::stub::StubFetcher;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  const ORIGIN: &str = "http://localhost:3000";

  fn layer(fetcher: StubFetcher) -> CacheLayer<SqliteBuckets, StubFetcher> {
    CacheLayer::new(
      SqliteBuckets::in_memory().unwrap(),
      fetcher,
      CacheConfig::default(),
      ORIGIN,
    )
    .unwrap()
  }

  fn online_fetcher() -> StubFetcher {
    let fetcher = StubFetcher::new();
    for path in ["/", "/favicon.ico", "/manifest.json", "/fonts/pretendard.css"] {
      fetcher.respond(&format!("{}{}", ORIGIN, path), 200, path);
    }
    fetcher
  }

  #[tokio::test]
  async fn test_worker_activates_and_serves() {
    let handle = CacheWorker::spawn(layer(online_fetcher()));
    assert_eq!(handle.ready().await, WorkerState::Activated);

    let result = handle
      .fetch(Request::get("http://localhost:3000/favicon.ico").unwrap())
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.body, b"/favicon.ico".to_vec());
  }

  #[tokio::test]
  async fn test_worker_activation_removes_old_versions() {
    let layer = layer(online_fetcher());
    let request = Request::get("http://localhost:3000/").unwrap();
    layer
      .storage()
      .put("traveltailor-static-v0", &request, &Response::new(200, Vec::new()))
      .unwrap();

    let handle = CacheWorker::spawn(layer);
    handle.ready().await;

    assert!(handle.purge().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_worker_failed_install_still_serves() {
    let handle = CacheWorker::spawn(layer(StubFetcher::new()));
    assert_eq!(handle.ready().await, WorkerState::Redundant);

    let result = handle
      .fetch(Request::get("http://localhost:8000/api/plans").unwrap())
      .await
      .unwrap();
    assert_eq!(result.data.status, 503);
  }

  #[tokio::test]
  async fn test_worker_tile_commands() {
    let fetcher = online_fetcher();
    let url = "https://api.tiles.mapbox.com/v4/3/2/1.png";
    fetcher.respond(url, 200, "png");
    let handle = CacheWorker::spawn(layer(fetcher));

    handle.prefetch_tile(url).await.unwrap();
    assert!(handle.is_tile_cached(url).await.unwrap());

    assert_eq!(handle.clear_tile_cache().await.unwrap(), vec!["traveltailor-map-v1"]);
    assert!(!handle.is_tile_cached(url).await.unwrap());
  }

  #[tokio::test]
  async fn test_worker_settle_flushes_background_writes() {
    let fetcher = Arc::new(online_fetcher());
    let url = "http://localhost:8000/api/plans/7";
    fetcher.respond(url, 200, r#"{"id":7}"#);
    let layer = CacheLayer::new(
      SqliteBuckets::in_memory().unwrap(),
      Arc::clone(&fetcher),
      CacheConfig::default(),
      ORIGIN,
    )
    .unwrap();
    let handle = CacheWorker::spawn(layer);

    let first = handle.fetch(Request::get(url).unwrap()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    handle.settle().await.unwrap();

    fetcher.set_offline(true);
    let second = handle.fetch(Request::get(url).unwrap()).await.unwrap();
    assert_eq!(second.source, CacheSource::Offline);
    assert_eq!(second.data.body, br#"{"id":7}"#.to_vec());
  }

  #[tokio::test]
  async fn test_registry_is_idempotent() {
    let registry = WorkerRegistry::new();
    let inits = AtomicUsize::new(0);

    let first = registry
      .register(|| {
        inits.fetch_add(1, Ordering::SeqCst);
        Ok(layer(online_fetcher()))
      })
      .await
      .unwrap();
    let second = registry
      .register(|| {
        inits.fetch_add(1, Ordering::SeqCst);
        Ok(layer(online_fetcher()))
      })
      .await
      .unwrap();

    assert!(first.same_worker(&second));
    assert_eq!(inits.load(Ordering::SeqCst), 1);
  }
}
