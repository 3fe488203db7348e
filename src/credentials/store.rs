//! Local key-value storage for the non-native credential paths.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Synchronous string key-value store.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;
  fn set(&self, key: &str, value: &str) -> Result<()>;
  fn remove(&self, key: &str) -> Result<()>;
}

/// Key-value pairs in a single JSON file readable only by the owner.
pub struct FileKeyValueStore {
  path: PathBuf,
  lock: Mutex<()>,
}

impl FileKeyValueStore {
  /// Store at the default location.
  pub fn open() -> Result<Self> {
    let path = crate::config::Config::data_dir()?.join("credentials.json");
    Ok(Self::at(path))
  }

  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn load(&self) -> Result<BTreeMap<String, String>> {
    if !self.path.exists() {
      return Ok(BTreeMap::new());
    }

    let content = std::fs::read_to_string(&self.path)
      .map_err(|e| eyre!("Failed to read {}: {}", self.path.display(), e))?;
    if content.trim().is_empty() {
      return Ok(BTreeMap::new());
    }

    serde_json::from_str(&content)
      .map_err(|e| eyre!("Failed to parse {}: {}", self.path.display(), e))
  }

  fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create directory {}: {}", parent.display(), e))?;
    }

    let content = serde_json::to_string_pretty(entries)
      .map_err(|e| eyre!("Failed to serialize credentials: {}", e))?;
    std::fs::write(&self.path, content)
      .map_err(|e| eyre!("Failed to write {}: {}", self.path.display(), e))?;

    // Set restrictive permissions on credential file
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let perms = std::fs::Permissions::from_mode(0o600);
      std::fs::set_permissions(&self.path, perms)
        .map_err(|e| eyre!("Failed to set permissions on {}: {}", self.path.display(), e))?;
    }

    Ok(())
  }
}

impl KeyValueStore for FileKeyValueStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(self.load()?.remove(key))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut entries = self.load()?;
    entries.insert(key.to_string(), value.to_string());
    self.save(&entries)?;
    debug!("Stored {} in {}", key, self.path.display());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut entries = self.load()?;
    if entries.remove(key).is_some() {
      self.save(&entries)?;
      debug!("Removed {} from {}", key, self.path.display());
    }
    Ok(())
  }
}

/// In-process store, lost on exit.
#[derive(Default)]
pub struct MemoryKeyValueStore {
  entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryKeyValueStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let entries = self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut entries = self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_file_store_set_get_remove() {
    let temp = TempDir::new().unwrap();
    let store = FileKeyValueStore::at(temp.path().join("nested").join("credentials.json"));

    assert_eq!(store.get("k").unwrap(), None);
    store.set("k", "v").unwrap();
    store.set("other", "w").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
    assert_eq!(store.get("other").unwrap().as_deref(), Some("w"));
  }

  #[test]
  fn test_file_store_persists_across_instances() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("credentials.json");

    FileKeyValueStore::at(&path).set("k", "v").unwrap();
    assert_eq!(FileKeyValueStore::at(&path).get("k").unwrap().as_deref(), Some("v"));
  }

  #[cfg(unix)]
  #[test]
  fn test_file_store_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let store = FileKeyValueStore::at(temp.path().join("credentials.json"));
    store.set("k", "v").unwrap();

    let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
  }

  #[test]
  fn test_memory_store() {
    let store = MemoryKeyValueStore::new();
    store.set("k", "v").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
  }
}
