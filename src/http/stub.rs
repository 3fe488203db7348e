//! Scripted fetcher for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{Fetcher, Request, Response};

/// Answers requests from a URL -> response table and counts calls per URL.
/// Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct StubFetcher {
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
}

impl StubFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Response::new(status, body.as_bytes().to_vec()));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self, url: &str) -> usize {
    self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
  }
}

#[async_trait]
impl Fetcher for StubFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    *self.calls.lock().unwrap().entry(url.clone()).or_insert(0) += 1;

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", url));
    }

    self
      .routes
      .lock()
      .unwrap()
      .get(&url)
      .cloned()
      .ok_or_else(|| eyre!("Failed to fetch {}: connection refused", url))
  }
}

/// Lets a test keep scripting the stub after handing it to a layer.
#[async_trait]
impl Fetcher for Arc<StubFetcher> {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    <StubFetcher as Fetcher>::fetch(self, request).await
  }
}
