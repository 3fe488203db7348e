//! Queue storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::{Method, QueueItem};

/// Trait for durable queue backends.
///
/// Every method runs as one transaction against the underlying store, so
/// concurrent writers (several processes on the same file) never lose each
/// other's items.
pub trait QueueStore: Send + Sync {
  /// Insert an item, overwriting any item with the same id.
  fn enqueue(&self, item: &QueueItem) -> Result<()>;

  /// Return every item in replay order and remove them, atomically.
  fn drain_all(&self) -> Result<Vec<QueueItem>>;

  /// Return every item in replay order without removing anything.
  fn peek_all(&self) -> Result<Vec<QueueItem>>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;

  /// Number of queued items.
  fn pending_count(&self) -> Result<usize> {
    Ok(self.peek_all()?.len())
  }
}

/// SQLite-based queue implementation.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

impl SqliteQueue {
  /// Open the queue at the default location.
  pub fn open() -> Result<Self> {
    let path = crate::config::Config::data_dir()?.join("queue.db");
    Self::open_at(&path)
  }

  /// Open (or create) the queue database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    Self::with_connection(conn)
  }

  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let queue = Self {
      conn: Mutex::new(conn),
    };
    queue.run_migrations()?;
    Ok(queue)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }
}

const QUEUE_SCHEMA: &str = r#"
-- seq is the insertion-order tie breaker
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    payload TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at, seq);
CREATE INDEX IF NOT EXISTS idx_sync_queue_endpoint ON sync_queue(endpoint);
"#;

const SELECT_ORDERED: &str = "SELECT id, endpoint, method, payload, created_at FROM sync_queue
   ORDER BY created_at ASC, seq ASC";

type ItemRow = (String, String, String, Option<String>, i64);

fn read_items(conn: &Connection) -> Result<Vec<QueueItem>> {
  let mut stmt = conn
    .prepare(SELECT_ORDERED)
    .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

  let rows = stmt
    .query_map([], |row| {
      Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    })
    .map_err(|e| eyre!("Failed to read queue: {}", e))?
    .collect::<rusqlite::Result<Vec<ItemRow>>>()
    .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

  rows.into_iter().map(decode_item).collect()
}

fn decode_item((id, endpoint, method, payload, created_at): ItemRow) -> Result<QueueItem> {
  let method: Method = method.parse()?;
  let payload = payload
    .map(|p| serde_json::from_str(&p))
    .transpose()
    .map_err(|e| eyre!("Failed to deserialize payload of {}: {}", id, e))?;

  Ok(QueueItem {
    id,
    endpoint,
    method,
    payload,
    created_at,
  })
}

impl QueueStore for SqliteQueue {
  fn enqueue(&self, item: &QueueItem) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let payload = item
      .payload
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (id, endpoint, method, payload, created_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
           endpoint = excluded.endpoint,
           method = excluded.method,
           payload = excluded.payload,
           created_at = excluded.created_at",
        params![item.id, item.endpoint, item.method.as_str(), payload, item.created_at],
      )
      .map_err(|e| eyre!("Failed to enqueue {}: {}", item.id, e))?;

    Ok(())
  }

  fn drain_all(&self) -> Result<Vec<QueueItem>> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // IMMEDIATE takes the write lock up front so no other writer can slip
    // an item in between the read and the delete
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let items = read_items(&tx)?;
    tx.execute("DELETE FROM sync_queue", [])
      .map_err(|e| eyre!("Failed to drain queue: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(items)
  }

  fn peek_all(&self) -> Result<Vec<QueueItem>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    read_items(&conn)
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM sync_queue", [])
      .map_err(|e| eyre!("Failed to clear queue: {}", e))?;

    Ok(())
  }

  fn pending_count(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn item(id: &str, created_at: i64) -> QueueItem {
    QueueItem {
      id: id.to_string(),
      endpoint: format!("/v1/travel-plans/{}", id),
      method: Method::Put,
      payload: Some(serde_json::json!({ "id": id })),
      created_at,
    }
  }

  fn ids(items: &[QueueItem]) -> Vec<&str> {
    items.iter().map(|i| i.id.as_str()).collect()
  }

  #[test]
  fn test_drain_orders_by_created_at() {
    let queue = SqliteQueue::in_memory().unwrap();
    queue.enqueue(&item("c", 300)).unwrap();
    queue.enqueue(&item("a", 100)).unwrap();
    queue.enqueue(&item("b", 200)).unwrap();

    assert_eq!(ids(&queue.drain_all().unwrap()), vec!["a", "b", "c"]);
  }

  #[test]
  fn test_ties_keep_insertion_order() {
    let queue = SqliteQueue::in_memory().unwrap();
    queue.enqueue(&item("second", 100)).unwrap();
    queue.enqueue(&item("first", 50)).unwrap();
    queue.enqueue(&item("third", 100)).unwrap();

    assert_eq!(ids(&queue.peek_all().unwrap()), vec!["first", "second", "third"]);
  }

  #[test]
  fn test_peek_and_drain_agree_then_drain_empties() {
    let queue = SqliteQueue::in_memory().unwrap();
    for (id, at) in [("x", 5), ("y", 1), ("z", 3)] {
      queue.enqueue(&item(id, at)).unwrap();
    }

    let peeked = queue.peek_all().unwrap();
    let drained = queue.drain_all().unwrap();

    assert_eq!(peeked, drained);
    assert!(queue.peek_all().unwrap().is_empty());
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[test]
  fn test_enqueue_overwrites_by_id() {
    let queue = SqliteQueue::in_memory().unwrap();
    queue.enqueue(&item("a", 100)).unwrap();

    let mut updated = item("a", 100);
    updated.payload = None;
    updated.method = Method::Delete;
    queue.enqueue(&updated).unwrap();

    let items = queue.peek_all().unwrap();
    assert_eq!(items, vec![updated]);
  }

  #[test]
  fn test_clear() {
    let queue = SqliteQueue::in_memory().unwrap();
    queue.enqueue(&item("a", 1)).unwrap();
    queue.enqueue(&item("b", 2)).unwrap();
    assert_eq!(queue.pending_count().unwrap(), 2);

    queue.clear().unwrap();
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[test]
  fn test_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.db");

    {
      let queue = SqliteQueue::open_at(&path).unwrap();
      queue.enqueue(&item("persisted", 7)).unwrap();
    }

    let queue = SqliteQueue::open_at(&path).unwrap();
    assert_eq!(ids(&queue.peek_all().unwrap()), vec!["persisted"]);
  }

  #[test]
  fn test_concurrent_writers_keep_both_items() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.db");
    let tab_a = SqliteQueue::open_at(&path).unwrap();
    let tab_b = SqliteQueue::open_at(&path).unwrap();

    tab_a.enqueue(&item("from-a", 1)).unwrap();
    tab_b.enqueue(&item("from-b", 2)).unwrap();

    assert_eq!(ids(&tab_a.drain_all().unwrap()), vec!["from-a", "from-b"]);
    assert!(tab_b.peek_all().unwrap().is_empty());
  }

  #[test]
  fn test_payload_absent_round_trips_as_none() {
    let queue = SqliteQueue::in_memory().unwrap();
    let mut delete = item("d", 1);
    delete.method = Method::Delete;
    delete.payload = None;
    queue.enqueue(&delete).unwrap();

    assert_eq!(queue.drain_all().unwrap()[0].payload, None);
  }
}
