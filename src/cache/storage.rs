//! Bucket storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::http::{Request, Response};

/// A response held in a bucket.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// The stored response
  pub response: Response,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

/// Trait for bucket storage backends.
///
/// A bucket is a named set of request -> response pairs. Entries keep the
/// position of their first insertion; overwriting an entry does not move it.
pub trait BucketStorage: Send + Sync {
  /// Create the bucket if it does not exist.
  fn open_bucket(&self, bucket: &str) -> Result<()>;

  /// Look up a request in one bucket.
  fn match_request(&self, bucket: &str, request: &Request) -> Result<Option<CachedEntry>>;

  /// Look up a request across all buckets, oldest bucket first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedEntry>>;

  /// Store a response, creating the bucket if needed.
  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<()>;

  /// URLs of the bucket's entries in insertion order.
  fn keys(&self, bucket: &str) -> Result<Vec<String>>;

  /// Number of entries in the bucket.
  fn count(&self, bucket: &str) -> Result<usize>;

  /// Remove the oldest-inserted entries until at most `max_entries` remain.
  /// Returns the URLs evicted.
  fn trim_oldest(&self, bucket: &str, max_entries: usize) -> Result<Vec<String>>;

  /// Names of all buckets, in creation order.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Drop a bucket and everything in it. Returns whether it existed.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;
}

/// SQLite-based bucket storage implementation.
pub struct SqliteBuckets {
  conn: Mutex<Connection>,
}

impl SqliteBuckets {
  /// Open the bucket database at the default location.
  pub fn open() -> Result<Self> {
    let path = crate::config::Config::data_dir()?.join("cache.db");
    Self::open_at(&path)
  }

  /// Open (or create) the bucket database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    Self::with_connection(conn)
  }

  /// Private in-memory database, used by tests and ephemeral runs.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for bucket tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(BUCKET_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for bucket tables.
const BUCKET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    position INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- seq records first insertion; upserts keep it
CREATE TABLE IF NOT EXISTS bucket_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (bucket, request_key)
);

CREATE INDEX IF NOT EXISTS idx_bucket_entries_order
    ON bucket_entries(bucket, seq);
"#;

const ENTRY_COLUMNS: &str = "e.status, e.headers, e.body, e.cached_at";

type EntryRow = (u16, String, Vec<u8>, String);

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_entry((status, headers, body, cached_at): EntryRow) -> Result<CachedEntry> {
  let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

  Ok(CachedEntry {
    response: Response {
      status,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl BucketStorage for SqliteBuckets {
  fn open_bucket(&self, bucket: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

    Ok(())
  }

  fn match_request(&self, bucket: &str, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row = conn
      .query_row(
        &format!(
          "SELECT {} FROM bucket_entries e WHERE e.bucket = ? AND e.request_key = ?",
          ENTRY_COLUMNS
        ),
        params![bucket, request.cache_key()],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query bucket {}: {}", bucket, e))?;

    row.map(decode_entry).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row = conn
      .query_row(
        &format!(
          "SELECT {} FROM bucket_entries e
           INNER JOIN buckets b ON b.name = e.bucket
           WHERE e.request_key = ?
           ORDER BY b.position
           LIMIT 1",
          ENTRY_COLUMNS
        ),
        params![request.cache_key()],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query buckets: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

    tx.execute(
      "INSERT INTO bucket_entries (bucket, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
       ON CONFLICT (bucket, request_key) DO UPDATE SET
         status = excluded.status,
         headers = excluded.headers,
         body = excluded.body,
         cached_at = excluded.cached_at",
      params![
        bucket,
        request.cache_key(),
        request.url.as_str(),
        response.status,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry in {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, bucket: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT url FROM bucket_entries WHERE bucket = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![bucket], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key of {}: {}", bucket, e))?;

    Ok(keys)
  }

  fn count(&self, bucket: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM bucket_entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", bucket, e))?;

    Ok(count as usize)
  }

  fn trim_oldest(&self, bucket: &str, max_entries: usize) -> Result<Vec<String>> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let count: i64 = tx
      .query_row(
        "SELECT COUNT(*) FROM bucket_entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", bucket, e))?;

    let excess = (count as usize).saturating_sub(max_entries);
    if excess == 0 {
      return Ok(Vec::new());
    }

    let victims: Vec<(i64, String)> = {
      let mut stmt = tx
        .prepare("SELECT seq, url FROM bucket_entries WHERE bucket = ? ORDER BY seq LIMIT ?")
        .map_err(|e| eyre!("Failed to prepare eviction query: {}", e))?;
      let rows = stmt
        .query_map(params![bucket, excess as i64], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| eyre!("Failed to select eviction victims: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read eviction victim: {}", e))?;
      rows
    };

    for (seq, _) in &victims {
      tx.execute("DELETE FROM bucket_entries WHERE seq = ?", params![seq])
        .map_err(|e| eyre!("Failed to evict entry from {}: {}", bucket, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(victims.into_iter().map(|(_, url)| url).collect())
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY position")
      .map_err(|e| eyre!("Failed to prepare bucket query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM bucket_entries WHERE bucket = ?",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;

    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
