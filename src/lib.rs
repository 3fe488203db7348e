//! Offline resilience for an HTTP client application.
//!
//! - [`cache`]: per-request caching policies run by a background worker
//! - [`queue`]: durable FIFO of mutations made while offline
//! - [`monitor`]: connectivity tracking that replays the queue
//! - [`credentials`]: bearer token storage chosen by hosting environment
//! - [`api`]: backend client tying credentials and the queue together

pub mod api;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod http;
pub mod logging;
pub mod monitor;
pub mod queue;
