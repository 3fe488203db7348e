//! Cache layer that orchestrates caching policies with network fetching.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::{Origin, Url};

use super::storage::BucketStorage;
use super::traits::{CacheResult, Policy};
use crate::config::CacheConfig;
use crate::http::{Fetcher, Request, Response};

/// Cache layer that picks a policy per request and serves it from its
/// buckets and the network.
///
/// Background writes (network-first stores, revalidations, tile refreshes)
/// never block the caller; [`CacheLayer::settle`] waits for them.
pub struct CacheLayer<S: BucketStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  config: Arc<CacheConfig>,
  origin: Origin,
  background: Arc<Mutex<JoinSet<()>>>,
}

impl<S: BucketStorage + 'static, F: Fetcher> CacheLayer<S, F> {
  /// Create a new cache layer for pages served from `origin`.
  pub fn new(storage: S, fetcher: F, config: CacheConfig, origin: &str) -> Result<Self> {
    let origin = Url::parse(origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?
      .origin();

    Ok(Self {
      storage: Arc::new(storage),
      fetcher: Arc::new(fetcher),
      config: Arc::new(config),
      origin,
      background: Arc::new(Mutex::new(JoinSet::new())),
    })
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Pick the policy for a request. `None` means pass-through (non-GET).
  ///
  /// First match wins: static assets, map tiles, API, everything else.
  pub fn classify(&self, request: &Request) -> Option<Policy> {
    if request.method != Method::GET {
      return None;
    }

    let url = &request.url;
    let path = url.path();

    if url.origin() == self.origin && self.config.static_assets.iter().any(|p| p == path) {
      return Some(Policy::CacheFirst);
    }

    if path.starts_with(&self.config.static_prefix) {
      return Some(Policy::CacheFirst);
    }

    let host = url.host_str().unwrap_or_default();
    let tile_host = self
      .config
      .tile_hosts
      .iter()
      .any(|h| !h.is_empty() && host.contains(h.as_str()));
    let tile_path =
      !self.config.tile_path_marker.is_empty() && path.contains(&self.config.tile_path_marker);
    if tile_host || tile_path {
      return Some(Policy::Tile);
    }

    if path.starts_with(&self.config.api_prefix) {
      return Some(Policy::NetworkFirst);
    }

    Some(Policy::StaleWhileRevalidate)
  }

  /// Serve an intercepted request.
  pub async fn handle(&self, request: Request) -> Result<CacheResult<Response>> {
    match self.classify(&request) {
      None => {
        let response = self.fetcher.fetch(&request).await?;
        Ok(CacheResult::from_network(response))
      }
      Some(Policy::CacheFirst) => self.cache_first(request).await,
      Some(Policy::Tile) => self.tile(request).await,
      Some(Policy::NetworkFirst) => Ok(self.network_first(request).await),
      Some(Policy::StaleWhileRevalidate) => self.stale_while_revalidate(request).await,
    }
  }

  /// Cached response if present, otherwise the network. A network failure
  /// with nothing cached propagates.
  pub async fn cache_first(&self, request: Request) -> Result<CacheResult<Response>> {
    if let Some(cached) = self.storage.match_any(&request)? {
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at, false));
    }

    let response = self.fetcher.fetch(&request).await?;
    if self.config.static_populate_on_miss && response.is_success() {
      self
        .storage
        .put(&self.config.static_bucket(), &request, &response)?;
    }
    Ok(CacheResult::from_network(response))
  }

  /// Network, then cache, then the offline placeholder. Never fails.
  pub async fn network_first(&self, request: Request) -> CacheResult<Response> {
    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          let storage = Arc::clone(&self.storage);
          let bucket = self.config.api_bucket();
          let stored = response.clone();
          self
            .spawn_background(async move {
              if let Err(e) = storage.put(&bucket, &request, &stored) {
                warn!("Failed to cache {}: {}", request.url, e);
              }
            })
            .await;
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!("Network-first fetch failed, falling back to cache: {}", e);
        match self.storage.match_any(&request) {
          Ok(Some(cached)) => CacheResult::offline(cached.response, cached.cached_at),
          Ok(None) => CacheResult::synthesized(Response::offline()),
          Err(e) => {
            warn!("Cache lookup failed for {}: {}", request.url, e);
            CacheResult::synthesized(Response::offline())
          }
        }
      }
    }
  }

  /// Cached response immediately with a background refresh, or the network
  /// when nothing is cached.
  pub async fn stale_while_revalidate(&self, request: Request) -> Result<CacheResult<Response>> {
    let bucket = self.config.api_bucket();
    let cached = self.storage.match_request(&bucket, &request)?;

    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);

    match cached {
      Some(cached) => {
        self
          .spawn_background(async move {
            match fetcher.fetch(&request).await {
              Ok(response) => {
                if let Err(e) = storage.put(&bucket, &request, &response) {
                  warn!("Failed to refresh {}: {}", request.url, e);
                }
              }
              Err(e) => debug!("Background revalidation failed: {}", e),
            }
          })
          .await;
        Ok(CacheResult::from_cache(cached.response, cached.cached_at, true))
      }
      None => {
        let response = fetcher.fetch(&request).await?;
        let stored = response.clone();
        self
          .spawn_background(async move {
            if let Err(e) = storage.put(&bucket, &request, &stored) {
              warn!("Failed to cache {}: {}", request.url, e);
            }
          })
          .await;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  /// Cached tile immediately with a background refresh; on a miss, fetch,
  /// store and trim the tile bucket before answering.
  pub async fn tile(&self, request: Request) -> Result<CacheResult<Response>> {
    let bucket = self.config.tile_bucket();
    let cached = self.storage.match_request(&bucket, &request)?;

    match cached {
      Some(cached) => {
        let storage = Arc::clone(&self.storage);
        let fetcher = Arc::clone(&self.fetcher);
        let max_entries = self.config.tile_max_entries;
        self
          .spawn_background(async move {
            match fetcher.fetch(&request).await {
              Ok(response) => {
                let stored = store_tile(storage.as_ref(), &bucket, max_entries, &request, &response);
                if let Err(e) = stored {
                  warn!("Failed to refresh tile {}: {}", request.url, e);
                }
              }
              Err(e) => debug!("Tile refresh failed, keeping cached tile: {}", e),
            }
          })
          .await;
        Ok(CacheResult::from_cache(cached.response, cached.cached_at, true))
      }
      None => {
        let response = self.fetcher.fetch(&request).await?;
        store_tile(
          self.storage.as_ref(),
          &bucket,
          self.config.tile_max_entries,
          &request,
          &response,
        )?;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  /// Whether the static bucket already holds every allow-listed asset.
  pub fn is_installed(&self) -> Result<bool> {
    let bucket = self.config.static_bucket();
    let origin = self.origin.ascii_serialization();
    for path in &self.config.static_assets {
      let request = Request::get(&format!("{}{}", origin, path))?;
      if self.storage.match_request(&bucket, &request)?.is_none() {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Pre-populate the static bucket with the allow-list.
  ///
  /// All-or-nothing: if any asset fails to fetch, nothing is stored and the
  /// install fails.
  pub async fn install(&self) -> Result<usize> {
    let bucket = self.config.static_bucket();
    self.storage.open_bucket(&bucket)?;

    let origin = self.origin.ascii_serialization();
    let origin = origin.as_str();
    let fetches = self.config.static_assets.iter().map(|path| async move {
      let request = Request::get(&format!("{}{}", origin, path))?;
      let response = self
        .fetcher
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to pre-cache {}: {}", path, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to pre-cache {}: status {}",
          path,
          response.status
        ));
      }
      Ok((request, response))
    });
    let fetched: Vec<(Request, Response)> = futures::future::try_join_all(fetches).await?;

    for (request, response) in &fetched {
      self.storage.put(&bucket, request, response)?;
    }

    info!("Pre-cached {} static assets into {}", fetched.len(), bucket);
    Ok(fetched.len())
  }

  /// Delete every bucket not belonging to the current version.
  /// Returns the names deleted.
  pub fn activate(&self) -> Result<Vec<String>> {
    let current = self.config.current_buckets();
    let mut deleted = Vec::new();

    for name in self.storage.bucket_names()? {
      if !current.contains(&name) {
        self.storage.delete_bucket(&name)?;
        deleted.push(name);
      }
    }

    if !deleted.is_empty() {
      info!("Deleted stale buckets: {}", deleted.join(", "));
    }
    Ok(deleted)
  }

  /// Fetch and store a tile outside request interception.
  pub async fn prefetch_tile(&self, url: &str) -> Result<()> {
    let request = Request::get(url)?;
    let response = self.fetcher.fetch(&request).await?;
    store_tile(
      self.storage.as_ref(),
      &self.config.tile_bucket(),
      self.config.tile_max_entries,
      &request,
      &response,
    )
  }

  pub fn is_tile_cached(&self, url: &str) -> Result<bool> {
    let request = Request::get(url)?;
    Ok(
      self
        .storage
        .match_request(&self.config.tile_bucket(), &request)?
        .is_some(),
    )
  }

  /// Drop tile buckets of every version. Returns the names deleted.
  pub fn clear_tile_cache(&self) -> Result<Vec<String>> {
    let prefix = self.config.tile_bucket_prefix();
    let mut deleted = Vec::new();
    for name in self.storage.bucket_names()? {
      if name.starts_with(&prefix) {
        self.storage.delete_bucket(&name)?;
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Wait for all background cache writes started so far.
  pub async fn settle(&self) {
    let mut tasks = self.background.lock().await;
    while let Some(result) = tasks.join_next().await {
      if let Err(e) = result {
        warn!("Background cache task failed: {}", e);
      }
    }
  }

  async fn spawn_background<Fut>(&self, task: Fut)
  where
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut tasks = self.background.lock().await;
    // Reap finished tasks so the set does not grow without bound
    while tasks.try_join_next().is_some() {}
    tasks.spawn(task);
  }
}

/// Store a tile and evict the oldest-inserted tiles beyond the cap.
fn store_tile<S: BucketStorage + ?Sized>(
  storage: &S,
  bucket: &str,
  max_entries: usize,
  request: &Request,
  response: &Response,
) -> Result<()> {
  storage.put(bucket, request, response)?;
  for url in storage.trim_oldest(bucket, max_entries)? {
    debug!("Evicted tile {}", url);
  }
  Ok(())
}

impl<S: BucketStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      config: Arc::clone(&self.config),
      origin: self.origin.clone(),
      background: Arc::clone(&self.background),
    }
  }
}
