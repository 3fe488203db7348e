//! Backend API client for mutations.
//!
//! Attaches credentials to every request, parks mutations in the queue when
//! the server cannot be reached, and replays them for the network monitor.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::credentials::{CredentialStore, Strategy};
use crate::monitor::ReplayHandler;
use crate::queue::{Method, QueueItem, QueueStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CSRF_ENDPOINT: &str = "/v1/csrf-token";

/// What happened to a mutation.
#[derive(Debug)]
pub enum MutationOutcome {
  /// The server answered
  Sent { status: u16, body: String },
  /// The server was unreachable; the mutation waits in the queue
  Queued(QueueItem),
}

#[derive(Deserialize)]
struct CsrfResponse {
  csrf_token: String,
}

/// Client for the application backend.
pub struct ApiClient<S: QueueStore> {
  client: reqwest::Client,
  base_url: Url,
  credentials: CredentialStore,
  queue: Arc<S>,
  /// Cached CSRF token for cookie sessions
  csrf_token: Mutex<Option<String>>,
}

impl<S: QueueStore> ApiClient<S> {
  pub fn new(config: &Config, credentials: CredentialStore, queue: Arc<S>) -> Result<Self> {
    let base_url = Url::parse(&config.api_base_url)
      .map_err(|e| eyre!("Invalid api_base_url '{}': {}", config.api_base_url, e))?;

    let client = reqwest::Client::builder()
      .user_agent(config.user_agent.as_str())
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      credentials,
      queue,
      csrf_token: Mutex::new(None),
    })
  }

  pub fn queue(&self) -> &Arc<S> {
    &self.queue
  }

  /// Send a mutation now, or queue it if the server is unreachable.
  pub async fn mutate(
    &self,
    endpoint: &str,
    method: Method,
    payload: Option<serde_json::Value>,
  ) -> Result<MutationOutcome> {
    let item = QueueItem::new(endpoint, method, payload);

    match self.send(&item).await? {
      Ok(response) => {
        let status = response.status();
        let body = response
          .text()
          .await
          .map_err(|e| eyre!("Failed to read response body: {}", e))?;
        Ok(MutationOutcome::Sent {
          status: status.as_u16(),
          body,
        })
      }
      Err(e) if is_unreachable(&e) => {
        warn!("Server unreachable, queueing {} {}: {}", item.method, item.endpoint, e);
        self.queue.enqueue(&item)?;
        Ok(MutationOutcome::Queued(item))
      }
      Err(e) => Err(eyre!("Failed to send {} {}: {}", item.method, item.endpoint, e)),
    }
  }

  /// Issue the request for `item`. The outer `Result` carries local
  /// failures (bad endpoint, credential storage), the inner one the
  /// transport outcome.
  async fn send(&self, item: &QueueItem) -> Result<reqwest::Result<reqwest::Response>> {
    let url = self
      .base_url
      .join(&item.endpoint)
      .map_err(|e| eyre!("Invalid endpoint '{}': {}", item.endpoint, e))?;

    let mut request = self.client.request(item.method.as_http(), url);
    if let Some(authorization) = self.credentials.authorization_header().await? {
      request = request.header(reqwest::header::AUTHORIZATION, authorization);
    }
    if let Some(csrf) = self.csrf_token().await {
      request = request.header("X-CSRF-Token", csrf);
    }
    if let Some(payload) = &item.payload {
      request = request.json(payload);
    }

    let response = match request.send().await {
      Ok(response) => response,
      Err(e) => return Ok(Err(e)),
    };

    match response.status() {
      StatusCode::UNAUTHORIZED => {
        info!("Session rejected, clearing stored token");
        self.credentials.clear_token().await?;
      }
      StatusCode::FORBIDDEN => {
        // Token may have rotated; fetch a new one next time
        *self.csrf_token.lock().await = None;
      }
      _ => {}
    }

    Ok(Ok(response))
  }

  /// CSRF token for cookie sessions, fetched once and cached. Other
  /// strategies do not need one.
  async fn csrf_token(&self) -> Option<String> {
    if self.credentials.strategy() != Strategy::Cookie {
      return None;
    }

    let mut cached = self.csrf_token.lock().await;
    if cached.is_none() {
      match self.fetch_csrf_token().await {
        Ok(token) => *cached = Some(token),
        Err(e) => debug!("No CSRF token available: {}", e),
      }
    }
    cached.clone()
  }

  async fn fetch_csrf_token(&self) -> Result<String> {
    let url = self
      .base_url
      .join(CSRF_ENDPOINT)
      .map_err(|e| eyre!("Invalid CSRF endpoint: {}", e))?;

    let response: CsrfResponse = self
      .client
      .get(url)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to fetch CSRF token: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse CSRF token: {}", e))?;

    Ok(response.csrf_token)
  }
}

#[async_trait]
impl<S: QueueStore + 'static> ReplayHandler for ApiClient<S> {
  async fn replay(&self, item: QueueItem) -> Result<()> {
    let response = self
      .send(&item)
      .await?
      .map_err(|e| eyre!("Failed to replay {} {}: {}", item.method, item.endpoint, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!(
        "Server rejected replay of {} {}: {}",
        item.method,
        item.endpoint,
        status
      ));
    }

    debug!("Replayed {} {} ({})", item.method, item.endpoint, item.id);
    Ok(())
  }
}

/// Connection-level failures that mean "offline" rather than "broken".
fn is_unreachable(error: &reqwest::Error) -> bool {
  error.is_connect() || error.is_timeout()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::credentials::{DisplayMode, Environment, MemoryKeyValueStore};
  use crate::queue::SqliteQueue;

  // Discard port; nothing listens there
  const UNREACHABLE: &str = "http://127.0.0.1:9";

  fn client(display_mode: DisplayMode) -> ApiClient<SqliteQueue> {
    let config = Config {
      api_base_url: UNREACHABLE.to_string(),
      ..Config::default()
    };
    let env = Environment {
      display_mode,
      native_bridge: None,
      user_agent: config.user_agent.clone(),
      origin: config.origin.clone(),
    };
    let credentials = CredentialStore::new(move || env.clone(), Arc::new(MemoryKeyValueStore::new()));
    ApiClient::new(&config, credentials, Arc::new(SqliteQueue::in_memory().unwrap())).unwrap()
  }

  #[tokio::test]
  async fn test_unreachable_server_queues_mutation() {
    let api = client(DisplayMode::Browser);
    let payload = serde_json::json!({ "title": "Jeju trip" });

    let outcome = api
      .mutate("/v1/travel-plans/1", Method::Patch, Some(payload.clone()))
      .await
      .unwrap();

    let MutationOutcome::Queued(item) = outcome else {
      panic!("expected the mutation to be queued");
    };
    let queued = api.queue().peek_all().unwrap();
    assert_eq!(queued, vec![item]);
    assert_eq!(queued[0].payload, Some(payload));
    assert_eq!(queued[0].method, Method::Patch);
  }

  #[tokio::test]
  async fn test_replay_against_unreachable_server_fails() {
    let api = client(DisplayMode::Standalone);
    api.credentials.store_token("abc123").await.unwrap();

    let item = QueueItem::new("/v1/travel-plans/1", Method::Delete, None);
    assert!(api.replay(item).await.is_err());
    assert_eq!(api.queue().pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_invalid_base_url_rejected() {
    let config = Config {
      api_base_url: "not a url".to_string(),
      ..Config::default()
    };
    let credentials = CredentialStore::new(
      move || Environment {
        display_mode: DisplayMode::Browser,
        native_bridge: None,
        user_agent: String::new(),
        origin: String::new(),
      },
      Arc::new(MemoryKeyValueStore::new()),
    );

    assert!(ApiClient::new(&config, credentials, Arc::new(SqliteQueue::in_memory().unwrap())).is_err());
  }
}
