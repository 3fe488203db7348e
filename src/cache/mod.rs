//! HTTP cache orchestration for GET traffic.
//!
//! This module decides, per request, which caching policy applies and keeps
//! the versioned buckets behind those policies:
//! - cache-first for the static allow-list and the built bundle
//! - a bounded, insertion-ordered tile bucket for map imagery
//! - network-first with an offline placeholder for API reads
//! - stale-while-revalidate for everything else
//!
//! The layer runs inside a [`CacheWorker`] task and is reached through a
//! [`WorkerHandle`].

mod layer;
mod storage;
mod traits;
mod worker;

pub use layer::CacheLayer;
pub use storage::{BucketStorage, CachedEntry, SqliteBuckets};
pub use traits::{CacheResult, CacheSource, Policy};
pub use worker::{register_cache_worker, CacheWorker, WorkerHandle, WorkerRegistry, WorkerState};
