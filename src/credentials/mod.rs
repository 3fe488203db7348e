//! Bearer token persistence.
//!
//! Where the token lives depends on how the application is hosted:
//! - `cookie`: the server keeps an httpOnly cookie, nothing is stored here
//! - `pwa`: encrypted in the local key-value store
//! - `native`: handed to the host's secure storage, or the `pwa` path when
//!   the host offers none
//!
//! The strategy is recomputed from the environment on every call.

mod cipher;
mod store;

pub use cipher::TokenCipher;
pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;

/// Single well-known key in whichever medium holds the token.
pub const STORAGE_KEY: &str = "traveltailor.auth.token";

/// How the application window is presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
  #[default]
  Browser,
  /// Installed app
  Standalone,
}

impl FromStr for DisplayMode {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "browser" => Ok(Self::Browser),
      "standalone" => Ok(Self::Standalone),
      other => Err(eyre!("Unknown display mode '{}' (expected browser or standalone)", other)),
    }
  }
}

/// Token persistence mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  Cookie,
  Pwa,
  Native,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Cookie => "cookie",
      Self::Pwa => "pwa",
      Self::Native => "native",
    })
  }
}

/// Host-provided secure storage.
#[async_trait]
pub trait SecureStorage: Send + Sync {
  async fn set(&self, key: &str, value: &str) -> Result<()>;
  async fn get(&self, key: &str) -> Result<Option<String>>;
  async fn remove(&self, key: &str) -> Result<()>;
}

/// Handle to the native shell hosting the application.
pub trait NativeBridge: Send + Sync {
  /// Secure storage capability, if the shell provides one.
  fn secure_storage(&self) -> Option<Arc<dyn SecureStorage>>;
}

/// Bridge for shells that expose no capabilities.
pub struct BareShell;

impl NativeBridge for BareShell {
  fn secure_storage(&self) -> Option<Arc<dyn SecureStorage>> {
    None
  }
}

/// Ambient signals the strategy and cipher key are derived from.
#[derive(Clone)]
pub struct Environment {
  pub display_mode: DisplayMode,
  pub native_bridge: Option<Arc<dyn NativeBridge>>,
  pub user_agent: String,
  pub origin: String,
}

impl Environment {
  pub fn from_config(config: &Config) -> Self {
    Self {
      display_mode: config.current_display_mode(),
      native_bridge: config
        .native_bridge
        .then(|| Arc::new(BareShell) as Arc<dyn NativeBridge>),
      user_agent: config.user_agent.clone(),
      origin: config.origin.clone(),
    }
  }
}

/// Pick the strategy for an environment. A native bridge wins over the
/// display mode.
pub fn detect_strategy(env: &Environment) -> Strategy {
  if env.native_bridge.is_some() {
    Strategy::Native
  } else if env.display_mode == DisplayMode::Standalone {
    Strategy::Pwa
  } else {
    Strategy::Cookie
  }
}

type EnvironmentProvider = Arc<dyn Fn() -> Environment + Send + Sync>;

/// Stores, reads and clears the bearer token.
#[derive(Clone)]
pub struct CredentialStore {
  environment: EnvironmentProvider,
  local: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
  pub fn new<E>(environment: E, local: Arc<dyn KeyValueStore>) -> Self
  where
    E: Fn() -> Environment + Send + Sync + 'static,
  {
    Self {
      environment: Arc::new(environment),
      local,
    }
  }

  /// Store wired to the config and the default credential file. The display
  /// mode is re-read from the environment on each call.
  pub fn from_config(config: &Config) -> Result<Self> {
    let config = config.clone();
    let local = FileKeyValueStore::open()?;
    Ok(Self::new(move || Environment::from_config(&config), Arc::new(local)))
  }

  pub fn strategy(&self) -> Strategy {
    detect_strategy(&(self.environment)())
  }

  pub async fn store_token(&self, token: &str) -> Result<()> {
    let env = (self.environment)();
    match detect_strategy(&env) {
      Strategy::Cookie => {
        debug!("Cookie strategy, token managed by the server");
        Ok(())
      }
      Strategy::Native => match secure_storage(&env) {
        Some(secure) => secure.set(STORAGE_KEY, token).await,
        None => self.store_local(&env, token),
      },
      Strategy::Pwa => self.store_local(&env, token),
    }
  }

  pub async fn read_token(&self) -> Result<Option<String>> {
    let env = (self.environment)();
    match detect_strategy(&env) {
      Strategy::Cookie => Ok(None),
      Strategy::Native => match secure_storage(&env) {
        Some(secure) => match secure.get(STORAGE_KEY).await {
          Ok(token) => Ok(token),
          Err(e) => {
            debug!("Secure storage read failed: {}", e);
            Ok(None)
          }
        },
        None => self.read_local(&env),
      },
      Strategy::Pwa => self.read_local(&env),
    }
  }

  pub async fn clear_token(&self) -> Result<()> {
    let env = (self.environment)();
    match detect_strategy(&env) {
      Strategy::Cookie => Ok(()),
      strategy => {
        if strategy == Strategy::Native {
          if let Some(secure) = secure_storage(&env) {
            secure.remove(STORAGE_KEY).await?;
          }
        }
        self.local.remove(STORAGE_KEY)
      }
    }
  }

  /// `Authorization` header value for outgoing requests, if a token is
  /// available and the server does not manage the session itself.
  pub async fn authorization_header(&self) -> Result<Option<String>> {
    if self.strategy() == Strategy::Cookie {
      return Ok(None);
    }
    Ok(self.read_token().await?.map(|token| format!("Bearer {}", token)))
  }

  fn store_local(&self, env: &Environment, token: &str) -> Result<()> {
    let encrypted = TokenCipher::derive(&env.user_agent, &env.origin).encrypt(token);
    self.local.set(STORAGE_KEY, &encrypted)
  }

  fn read_local(&self, env: &Environment) -> Result<Option<String>> {
    let stored = self.local.get(STORAGE_KEY)?;
    Ok(TokenCipher::derive(&env.user_agent, &env.origin).decrypt(stored.as_deref()))
  }
}

fn secure_storage(env: &Environment) -> Option<Arc<dyn SecureStorage>> {
  env
    .native_bridge
    .as_ref()
    .and_then(|bridge| bridge.secure_storage())
}
