//! Reachability polling, the native stand-in for browser online/offline
//! events.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::ConnectivitySignal;
use crate::http::{Fetcher, Request};

/// Polls a URL and reports connectivity transitions.
pub struct ConnectivityProbe<F: Fetcher> {
  fetcher: Arc<F>,
  request: Request,
  interval: Duration,
  last: Option<bool>,
}

impl<F: Fetcher> ConnectivityProbe<F> {
  pub fn new(fetcher: Arc<F>, url: &str, interval: Duration) -> Result<Self> {
    Ok(Self {
      fetcher,
      request: Request::get(url)?,
      interval,
      last: None,
    })
  }

  /// Any HTTP response counts as reachable, including error statuses.
  pub async fn is_reachable(&self) -> bool {
    match self.fetcher.fetch(&self.request).await {
      Ok(_) => true,
      Err(e) => {
        debug!("Probe of {} failed: {}", self.request.url, e);
        false
      }
    }
  }

  /// Probe once. Returns a signal only when reachability differs from the
  /// previous check.
  pub async fn check_once(&mut self) -> Option<ConnectivitySignal> {
    let online = self.is_reachable().await;
    if self.last == Some(online) {
      return None;
    }
    self.last = Some(online);
    Some(if online {
      ConnectivitySignal::Online
    } else {
      ConnectivitySignal::Offline
    })
  }

  /// Seed the last known state so the first probe only reports a change.
  pub fn assume(mut self, online: bool) -> Self {
    self.last = Some(online);
    self
  }

  /// Poll until the receiving side goes away.
  pub async fn run(mut self, signals: mpsc::Sender<ConnectivitySignal>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      if let Some(signal) = self.check_once().await {
        if signals.send(signal).await.is_err() {
          debug!("Connectivity listener gone, stopping probe");
          return;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::stub::StubFetcher;

  const PROBE: &str = "http://localhost:8000/health";

  fn probe(fetcher: &Arc<StubFetcher>) -> ConnectivityProbe<StubFetcher> {
    ConnectivityProbe::new(Arc::clone(fetcher), PROBE, Duration::from_millis(10)).unwrap()
  }

  #[tokio::test]
  async fn test_reports_only_transitions() {
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.respond(PROBE, 200, "ok");
    let mut probe = probe(&fetcher);

    assert_eq!(probe.check_once().await, Some(ConnectivitySignal::Online));
    assert_eq!(probe.check_once().await, None);

    fetcher.set_offline(true);
    assert_eq!(probe.check_once().await, Some(ConnectivitySignal::Offline));
    assert_eq!(probe.check_once().await, None);

    fetcher.set_offline(false);
    assert_eq!(probe.check_once().await, Some(ConnectivitySignal::Online));
  }

  #[tokio::test]
  async fn test_server_error_still_counts_as_online() {
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.respond(PROBE, 500, "down for maintenance");

    assert!(probe(&fetcher).is_reachable().await);
  }

  #[tokio::test]
  async fn test_assumed_state_suppresses_first_signal() {
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.respond(PROBE, 204, "");
    let mut probe = probe(&fetcher).assume(true);

    assert_eq!(probe.check_once().await, None);
  }

  #[tokio::test]
  async fn test_run_stops_when_receiver_dropped() {
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.respond(PROBE, 200, "ok");
    fetcher.set_offline(true);
    let (tx, mut rx) = mpsc::channel(1);
    let running = tokio::spawn(probe(&fetcher).run(tx));

    assert_eq!(rx.recv().await, Some(ConnectivitySignal::Offline));
    fetcher.set_offline(false);
    assert_eq!(rx.recv().await, Some(ConnectivitySignal::Online));
    drop(rx);
    fetcher.set_offline(true);

    running.await.unwrap();
  }
}
