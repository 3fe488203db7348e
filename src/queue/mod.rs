//! Durable FIFO of pending mutations.
//!
//! Writes that could not reach the server are parked here and replayed by
//! the network monitor once connectivity returns. Replay order is ascending
//! `created_at`, ties broken by insertion order.

mod store;

pub use store::{QueueStore, SqliteQueue};

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// HTTP methods that may be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }

  pub fn as_http(&self) -> reqwest::Method {
    match self {
      Self::Post => reqwest::Method::POST,
      Self::Put => reqwest::Method::PUT,
      Self::Patch => reqwest::Method::PATCH,
      Self::Delete => reqwest::Method::DELETE,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      other => Err(eyre!("Method {} cannot be queued (expected POST, PUT, PATCH or DELETE)", other)),
    }
  }
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
  /// Unique identifier, assigned at enqueue time
  pub id: String,
  /// Target resource path (relative to the API base URL)
  pub endpoint: String,
  pub method: Method,
  /// Request body; usually absent for DELETE
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<serde_json::Value>,
  /// Epoch milliseconds; the replay ordering key
  pub created_at: i64,
}

impl QueueItem {
  /// New item with a fresh id, stamped now.
  pub fn new(endpoint: &str, method: Method, payload: Option<serde_json::Value>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      endpoint: endpoint.to_string(),
      method,
      payload,
      created_at: Utc::now().timestamp_millis(),
    }
  }
}
