//! Connectivity monitor and queue replay.
//!
//! The monitor tracks two states, online and offline. Every transition to
//! online (including starting online) runs one drain-and-replay cycle over
//! the mutation queue. An online signal while already online changes
//! nothing. Items are replayed one at a time in queue order; items whose
//! replay fails are put back with their original timestamp.

mod probe;

pub use probe::ConnectivityProbe;

use async_trait::async_trait;
use color_eyre::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueItem, QueueStore};

/// Platform connectivity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
  Online,
  Offline,
}

/// What the UI gets to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
  pub online: bool,
  /// Items still waiting in the queue
  pub pending: usize,
}

/// Outcome of one drain-and-replay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
  pub drained: usize,
  pub replayed: usize,
  pub failed: usize,
  /// Queue length once the cycle finished
  pub pending: usize,
}

/// Re-issues a queued mutation.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
  async fn replay(&self, item: QueueItem) -> Result<()>;
}

#[async_trait]
impl<F, Fut> ReplayHandler for F
where
  F: Fn(QueueItem) -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send,
{
  async fn replay(&self, item: QueueItem) -> Result<()> {
    (self)(item).await
  }
}

type Listener = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Token returned by [`NetworkMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Drives queue replay from connectivity transitions.
pub struct NetworkMonitor<S: QueueStore, R: ReplayHandler> {
  queue: Arc<S>,
  handler: R,
  status: Mutex<NetworkStatus>,
  /// Held for the duration of a cycle; a cycle that cannot take it is skipped
  cycle: tokio::sync::Mutex<()>,
  listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
  next_id: AtomicU64,
}

impl<S: QueueStore + 'static, R: ReplayHandler + 'static> NetworkMonitor<S, R> {
  pub fn new(queue: Arc<S>, handler: R, online: bool) -> Self {
    Self {
      queue,
      handler,
      status: Mutex::new(NetworkStatus { online, pending: 0 }),
      cycle: tokio::sync::Mutex::new(()),
      listeners: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(0),
    }
  }

  /// Current status snapshot.
  pub fn status(&self) -> NetworkStatus {
    *self.status.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn is_online(&self) -> bool {
    self.status().online
  }

  pub fn pending_count(&self) -> usize {
    self.status().pending
  }

  /// Register a listener called on every status change.
  pub fn subscribe<L>(&self, listener: L) -> SubscriptionId
  where
    L: Fn(NetworkStatus) + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push((id, Arc::new(listener)));
    id
  }

  /// Remove a listener. Returns whether it was registered.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
    let before = listeners.len();
    listeners.retain(|(existing, _)| *existing != id);
    listeners.len() != before
  }

  pub fn subscriber_count(&self) -> usize {
    self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Re-read the queue length without replaying anything.
  pub fn refresh_pending(&self) -> Result<usize> {
    let pending = self.queue.pending_count()?;
    self.update(|status| status.pending = pending);
    Ok(pending)
  }

  /// Apply a connectivity signal. Going online spawns a replay cycle and
  /// returns its handle.
  pub fn handle_signal(
    self: &Arc<Self>,
    signal: ConnectivitySignal,
  ) -> Option<JoinHandle<Result<Option<CycleReport>>>> {
    match signal {
      ConnectivitySignal::Offline => {
        info!("Connectivity lost");
        self.update(|status| status.online = false);
        None
      }
      ConnectivitySignal::Online => {
        if self.update(|status| status.online = true).online {
          debug!("Already online, no replay cycle started");
          return None;
        }
        info!("Connectivity regained");
        let monitor = Arc::clone(self);
        Some(tokio::spawn(async move { monitor.sync_now().await }))
      }
    }
  }

  /// Run one drain-and-replay cycle. Returns `None` without touching the
  /// queue if another cycle is already running.
  pub async fn sync_now(&self) -> Result<Option<CycleReport>> {
    let Ok(_guard) = self.cycle.try_lock() else {
      debug!("Replay cycle already in progress, skipping");
      return Ok(None);
    };

    let items = self.queue.drain_all()?;
    let mut report = CycleReport {
      drained: items.len(),
      ..CycleReport::default()
    };
    if !items.is_empty() {
      info!("Replaying {} queued mutations", items.len());
    }

    // A failed re-enqueue is reported after the batch, never instead of it
    let mut requeue_error = None;
    for item in items {
      match self.handler.replay(item.clone()).await {
        Ok(()) => report.replayed += 1,
        Err(e) => {
          warn!("Failed to replay {} {} ({}): {}", item.method, item.endpoint, item.id, e);
          report.failed += 1;
          if let Err(e) = self.queue.enqueue(&item) {
            error!("Failed to re-enqueue {} ({}): {}", item.id, item.endpoint, e);
            requeue_error.get_or_insert(e);
          }
        }
      }
    }

    match self.queue.pending_count() {
      Ok(pending) => {
        report.pending = pending;
        self.update(|status| status.pending = pending);
      }
      Err(e) => {
        error!("Failed to count pending mutations: {}", e);
        requeue_error.get_or_insert(e);
      }
    }
    if let Some(e) = requeue_error {
      return Err(e);
    }

    if report.drained > 0 {
      info!(
        "Replay cycle done: {} replayed, {} failed, {} pending",
        report.replayed, report.failed, report.pending
      );
    }
    Ok(Some(report))
  }

  /// Consume connectivity signals until the channel closes. Starts with a
  /// cycle when already online.
  pub async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<ConnectivitySignal>) -> Result<()> {
    self.refresh_pending()?;

    let mut cycles: Vec<JoinHandle<Result<Option<CycleReport>>>> = Vec::new();
    if self.is_online() {
      cycles.push(tokio::spawn({
        let monitor = Arc::clone(&self);
        async move { monitor.sync_now().await }
      }));
    }

    while let Some(signal) = signals.recv().await {
      cycles.retain(|handle| !handle.is_finished());
      if let Some(handle) = self.handle_signal(signal) {
        cycles.push(handle);
      }
    }

    for handle in cycles {
      match handle.await {
        Ok(Err(e)) => warn!("Replay cycle failed: {}", e),
        Err(e) => warn!("Replay cycle panicked: {}", e),
        Ok(Ok(_)) => {}
      }
    }
    Ok(())
  }

  /// Apply `change` and notify listeners if it altered anything. Returns
  /// the status from before the change.
  fn update(&self, change: impl FnOnce(&mut NetworkStatus)) -> NetworkStatus {
    let (before, after) = {
      let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
      let before = *status;
      change(&mut status);
      (before, *status)
    };

    if before == after {
      return before;
    }

    // Call listeners outside the lock so they may read the monitor
    let listeners: Vec<Listener> = self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(_, listener)| Arc::clone(listener))
      .collect();
    for listener in listeners {
      listener(after);
    }
    before
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{Method, SqliteQueue};
  use color_eyre::eyre::eyre;
  use std::collections::HashSet;
  use std::sync::atomic::AtomicBool;
  use std::time::Duration;

  fn item(id: &str, created_at: i64) -> QueueItem {
    QueueItem {
      id: id.to_string(),
      endpoint: format!("/v1/travel-plans/{}", id),
      method: Method::Patch,
      payload: None,
      created_at,
    }
  }

  fn queue_with(items: &[QueueItem]) -> Arc<SqliteQueue> {
    let queue = SqliteQueue::in_memory().unwrap();
    for item in items {
      queue.enqueue(item).unwrap();
    }
    Arc::new(queue)
  }

  type Seen = Arc<Mutex<Vec<String>>>;

  /// Records replay order and fails for the configured ids.
  struct Recorder {
    seen: Seen,
    failing: HashSet<String>,
  }

  fn recorder(failing: &[&str]) -> (Recorder, Seen) {
    let seen = Seen::default();
    let recorder = Recorder {
      seen: Arc::clone(&seen),
      failing: failing.iter().map(|s| s.to_string()).collect(),
    };
    (recorder, seen)
  }

  fn seen(log: &Seen) -> Vec<String> {
    log.lock().unwrap().clone()
  }

  #[async_trait]
  impl ReplayHandler for Recorder {
    async fn replay(&self, item: QueueItem) -> Result<()> {
      self.seen.lock().unwrap().push(item.id.clone());
      if self.failing.contains(&item.id) {
        return Err(eyre!("server unavailable"));
      }
      Ok(())
    }
  }

  /// SQLite queue whose inserts can be switched to fail.
  struct BrokenInserts {
    inner: SqliteQueue,
    broken: AtomicBool,
  }

  impl BrokenInserts {
    fn with(items: &[QueueItem]) -> Arc<Self> {
      let store = Self {
        inner: SqliteQueue::in_memory().unwrap(),
        broken: AtomicBool::new(false),
      };
      for item in items {
        store.enqueue(item).unwrap();
      }
      Arc::new(store)
    }
  }

  impl QueueStore for BrokenInserts {
    fn enqueue(&self, item: &QueueItem) -> Result<()> {
      if self.broken.load(Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      self.inner.enqueue(item)
    }

    fn drain_all(&self) -> Result<Vec<QueueItem>> {
      self.inner.drain_all()
    }

    fn peek_all(&self) -> Result<Vec<QueueItem>> {
      self.inner.peek_all()
    }

    fn clear(&self) -> Result<()> {
      self.inner.clear()
    }
  }

  #[tokio::test]
  async fn test_replays_in_created_at_order() {
    let queue = queue_with(&[item("c", 3), item("a", 1), item("b", 2)]);
    let (recorder, log) = recorder(&[]);
    let monitor = NetworkMonitor::new(queue, recorder, true);

    let report = monitor.sync_now().await.unwrap().unwrap();

    assert_eq!(seen(&log), vec!["a", "b", "c"]);
    assert_eq!(report.replayed, 3);
    assert_eq!(report.pending, 0);
    assert_eq!(monitor.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_all_failures_survive_in_order() {
    let items = vec![item("a", 1), item("b", 2), item("c", 3)];
    let queue = queue_with(&items);
    let (recorder, _) = recorder(&["a", "b", "c"]);
    let monitor = NetworkMonitor::new(Arc::clone(&queue), recorder, true);

    let report = monitor.sync_now().await.unwrap().unwrap();

    assert_eq!(report.failed, 3);
    assert_eq!(monitor.pending_count(), 3);
    assert_eq!(queue.peek_all().unwrap(), items);
  }

  #[tokio::test]
  async fn test_partial_failure_keeps_only_failed_item() {
    let queue = queue_with(&[item("a", 10), item("b", 20)]);
    let (recorder, _) = recorder(&["b"]);
    let monitor = NetworkMonitor::new(Arc::clone(&queue), recorder, true);

    monitor.sync_now().await.unwrap();

    let remaining = queue.peek_all().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "b");
    assert_eq!(remaining[0].created_at, 20);
    assert_eq!(monitor.pending_count(), 1);
  }

  #[tokio::test]
  async fn test_failure_does_not_abandon_batch() {
    let queue = queue_with(&[item("a", 1), item("b", 2), item("c", 3)]);
    let (recorder, log) = recorder(&["a"]);
    let monitor = NetworkMonitor::new(Arc::clone(&queue), recorder, true);

    monitor.sync_now().await.unwrap();

    assert_eq!(seen(&log), vec!["a", "b", "c"]);
    assert_eq!(queue.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_requeue_failure_keeps_replaying_rest() {
    let queue = BrokenInserts::with(&[item("a", 1), item("b", 2), item("c", 3)]);
    queue.broken.store(true, Ordering::SeqCst);
    let (recorder, log) = recorder(&["a"]);
    let monitor = NetworkMonitor::new(Arc::clone(&queue), recorder, true);

    let result = monitor.sync_now().await;

    assert!(result.is_err());
    assert_eq!(seen(&log), vec!["a", "b", "c"]);
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(monitor.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_closure_handler() {
    let queue = queue_with(&[item("a", 1)]);
    let monitor = NetworkMonitor::new(queue, |_item: QueueItem| async { Ok::<_, color_eyre::Report>(()) }, true);

    let report = monitor.sync_now().await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
  }

  #[tokio::test]
  async fn test_overlapping_cycle_is_skipped() {
    let queue = queue_with(&[item("a", 1)]);
    let release = Arc::new(tokio::sync::Notify::new());
    let handler = {
      let release = Arc::clone(&release);
      move |_item: QueueItem| {
        let release = Arc::clone(&release);
        async move {
          release.notified().await;
          Ok::<_, color_eyre::Report>(())
        }
      }
    };
    let monitor = Arc::new(NetworkMonitor::new(Arc::clone(&queue), handler, false));

    let first = monitor.handle_signal(ConnectivitySignal::Online).unwrap();
    // Let the first cycle take the guard and block inside the handler
    while monitor.cycle.try_lock().is_ok() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }

    queue.enqueue(&item("b", 2)).unwrap();
    assert_eq!(monitor.sync_now().await.unwrap(), None);

    release.notify_one();
    let report = first.await.unwrap().unwrap().unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(queue.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_online_while_online_starts_no_cycle() {
    let queue = queue_with(&[item("a", 1)]);
    let (recorder, log) = recorder(&[]);
    let monitor = Arc::new(NetworkMonitor::new(Arc::clone(&queue), recorder, true));
    let changes = Arc::new(Mutex::new(0));
    monitor.subscribe({
      let changes = Arc::clone(&changes);
      move |_| *changes.lock().unwrap() += 1
    });

    assert!(monitor.handle_signal(ConnectivitySignal::Online).is_none());
    assert!(monitor.is_online());
    assert!(seen(&log).is_empty());
    assert_eq!(queue.pending_count().unwrap(), 1);
    assert_eq!(*changes.lock().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_signal_only_updates_state() {
    let queue = queue_with(&[item("a", 1)]);
    let (recorder, log) = recorder(&[]);
    let monitor = Arc::new(NetworkMonitor::new(Arc::clone(&queue), recorder, true));

    assert!(monitor.handle_signal(ConnectivitySignal::Offline).is_none());
    assert!(!monitor.is_online());
    assert!(seen(&log).is_empty());
    assert_eq!(queue.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_subscribers_see_changes_until_unsubscribed() {
    let queue = queue_with(&[]);
    let (recorder, _) = recorder(&[]);
    let monitor = Arc::new(NetworkMonitor::new(queue, recorder, true));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let id = monitor.subscribe({
      let seen = Arc::clone(&seen);
      move |status| seen.lock().unwrap().push(status.online)
    });
    monitor.handle_signal(ConnectivitySignal::Offline);
    assert!(monitor.unsubscribe(id));
    assert!(!monitor.unsubscribe(id));
    monitor
      .handle_signal(ConnectivitySignal::Online)
      .unwrap()
      .await
      .unwrap()
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![false]);
    assert_eq!(monitor.subscriber_count(), 0);
  }

  #[tokio::test]
  async fn test_run_replays_on_start_and_on_reconnect() {
    let queue = queue_with(&[item("a", 1)]);
    let (recorder, log) = recorder(&[]);
    let monitor = Arc::new(NetworkMonitor::new(Arc::clone(&queue), recorder, true));
    let (tx, rx) = mpsc::channel(4);

    let running = tokio::spawn(Arc::clone(&monitor).run(rx));
    tx.send(ConnectivitySignal::Offline).await.unwrap();
    queue.enqueue(&item("b", 2)).unwrap();
    tx.send(ConnectivitySignal::Online).await.unwrap();
    drop(tx);
    running.await.unwrap().unwrap();

    let mut replayed = seen(&log);
    replayed.sort();
    assert_eq!(replayed, vec!["a", "b"]);
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_run_finishes_cycle_in_flight_when_signals_close() {
    let queue = queue_with(&[item("a", 1)]);
    let log = Seen::default();
    let handler = {
      let log = Arc::clone(&log);
      move |item: QueueItem| {
        let log = Arc::clone(&log);
        async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          log.lock().unwrap().push(item.id);
          Ok::<_, color_eyre::Report>(())
        }
      }
    };
    let monitor = Arc::new(NetworkMonitor::new(Arc::clone(&queue), handler, false));
    let (tx, rx) = mpsc::channel(1);

    let running = tokio::spawn(Arc::clone(&monitor).run(rx));
    tx.send(ConnectivitySignal::Online).await.unwrap();
    drop(tx);
    running.await.unwrap().unwrap();

    assert_eq!(seen(&log), vec!["a"]);
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(monitor.pending_count(), 0);
  }
}
