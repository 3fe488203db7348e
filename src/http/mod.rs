//! HTTP request/response values and the network seam.
//!
//! Everything that leaves the process goes through a [`Fetcher`]. The cache
//! policies, the connectivity probe and the tests all talk to this trait, so
//! the network can be swapped for a scripted stub.

mod fetcher;

#[cfg(test)]
pub(crate) mod stub;

pub use fetcher::HttpFetcher;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// Something that can perform a network round trip.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  /// Perform the request. `Err` means the transport failed (no response at
  /// all); HTTP error statuses come back as `Ok`.
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// Build a GET request for the given URL.
  pub fn get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self {
      method: Method::GET,
      url,
      headers: BTreeMap::new(),
      body: None,
    })
  }

  /// Build a request with an arbitrary method.
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Stable lookup key for the bucket store.
  ///
  /// Buckets only ever hold GET responses, so the URL alone identifies the
  /// entry (fragment excluded, as the platform cache does).
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response, either fresh from the network, replayed from a bucket, or
/// synthesized by this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  /// The fixed 503 body served by network-first when nothing is cached.
  pub fn offline() -> Self {
    Self::new(503, br#"{"offline":true}"#.to_vec()).with_header("content-type", "application/json")
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// Body parsed as JSON.
  pub fn json(&self) -> Result<serde_json::Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Response body is not JSON: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_ignores_fragment() {
    let a = Request::get("https://example.com/api/plans?page=1#top").unwrap();
    let b = Request::get("https://example.com/api/plans?page=1").unwrap();
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_cache_key_distinguishes_query() {
    let a = Request::get("https://example.com/api/plans?page=1").unwrap();
    let b = Request::get("https://example.com/api/plans?page=2").unwrap();
    assert_ne!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_offline_response_shape() {
    let response = Response::offline();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("Content-Type"), Some("application/json"));
    assert_eq!(response.json().unwrap(), serde_json::json!({ "offline": true }));
  }

  #[test]
  fn test_invalid_url_rejected() {
    assert!(Request::get("not a url").is_err());
  }
}
