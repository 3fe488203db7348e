//! Core types for the caching system.

use chrono::{DateTime, Utc};

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  ///
  /// `revalidating` marks a cached value served while a background refresh runs.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, revalidating: bool) -> Self {
    Self {
      data,
      source: if revalidating {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// A response made up by this layer because nothing else was available.
  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, served without touching the network
  CacheFresh,
  /// Data from cache, served while a background refresh is in flight
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline mode with nothing cached - placeholder response
  Synthesized,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::CacheFresh => "cache",
      Self::CacheStale => "cache (revalidating)",
      Self::Offline => "cache (offline)",
      Self::Synthesized => "offline placeholder",
    };
    f.write_str(label)
  }
}

/// Caching policy applied to an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// Serve from cache, fall back to network
  CacheFirst,
  /// Bounded tile bucket, cache-then-refresh
  Tile,
  /// Network, fall back to cache, then to an offline placeholder
  NetworkFirst,
  /// Serve cache immediately, refresh in the background
  StaleWhileRevalidate,
}
