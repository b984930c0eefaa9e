//! Online/offline detection and the reconnect-triggered sync loop.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::reconciler::{Reconciler, SyncTrigger};
use crate::config::Config;
use crate::http::{resolve, Method, Request};
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
  Online,
  Offline,
}

/// Probes the server and publishes connectivity changes.
///
/// Any HTTP answer from the probe URL counts as online; only a transport
/// failure counts as offline. The state starts as `Offline`, so the first
/// successful probe behaves like a reconnect.
pub struct ConnectivityMonitor<N: Network> {
  network: Arc<N>,
  probe: Request,
  interval: Duration,
  state: watch::Sender<NetworkState>,
}

impl<N: Network> ConnectivityMonitor<N> {
  pub fn new(config: &Config, network: Arc<N>) -> Result<Self> {
    let probe_url = resolve(&config.origin, &config.connectivity.probe_path)?;
    let (state, _) = watch::channel(NetworkState::Offline);

    Ok(Self {
      network,
      probe: Request::new(Method::Get, probe_url),
      interval: config.connectivity.interval(),
      state,
    })
  }

  pub fn state(&self) -> NetworkState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.state.subscribe()
  }

  /// Probe once and publish the result. Returns true when this probe moved
  /// the state from offline to online.
  pub async fn check(&self) -> bool {
    let observed = match self.network.fetch(&self.probe).await {
      Ok(_) => NetworkState::Online,
      Err(e) => {
        debug!(error = %e, "connectivity probe failed");
        NetworkState::Offline
      }
    };

    let previous = self.state.send_replace(observed);
    if previous != observed {
      info!(?previous, current = ?observed, "connectivity changed");
    }
    previous == NetworkState::Offline && observed == NetworkState::Online
  }

  /// Probe on an interval until `shutdown` resolves. Reconnects trigger a
  /// sweep right away; while online, a sweep also runs every `sync_interval`.
  pub async fn run<F>(&self, reconciler: &Reconciler<N>, sync_interval: Duration, shutdown: F)
  where
    F: Future<Output = ()>,
  {
    let mut probe_tick = tokio::time::interval(self.interval);
    let mut sync_tick = tokio::time::interval(sync_interval);
    probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first sync tick fires immediately; the first probe covers it.
    sync_tick.tick().await;

    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => {
          debug!("connectivity monitor stopping");
          break;
        }
        _ = probe_tick.tick() => {
          if self.check().await {
            reconciler
              .sync_pending_operations(SyncTrigger::OnlineTransition)
              .await;
          }
        }
        _ = sync_tick.tick() => {
          if self.state() == NetworkState::Online {
            reconciler.sync_pending_operations(SyncTrigger::Periodic).await;
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::Response;
  use crate::store::{NewOperation, OfflineStore, OperationKind};
  use crate::sync::RetryPolicy;
  use crate::test_support::MockNetwork;

  const ORIGIN: &str = "https://erp.local";

  fn monitor(network: &MockNetwork) -> ConnectivityMonitor<MockNetwork> {
    let mut config = Config::with_origin(ORIGIN);
    config.connectivity.interval_secs = 1;
    ConnectivityMonitor::new(&config, Arc::new(network.clone())).unwrap()
  }

  #[tokio::test]
  async fn test_transitions() {
    let network = MockNetwork::new();
    network.respond("https://erp.local/api/health", Response::new(200, "ok"));
    let monitor = monitor(&network);
    let mut rx = monitor.subscribe();

    assert!(monitor.check().await);
    assert_eq!(monitor.state(), NetworkState::Online);
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), NetworkState::Online);

    // Staying online is not a transition
    assert!(!monitor.check().await);

    network.set_offline(true);
    assert!(!monitor.check().await);
    assert_eq!(monitor.state(), NetworkState::Offline);

    network.set_offline(false);
    assert!(monitor.check().await);
  }

  #[tokio::test]
  async fn test_server_error_still_counts_as_online() {
    let network = MockNetwork::new();
    network.respond("https://erp.local/api/health", Response::new(500, ""));
    let monitor = monitor(&network);

    assert!(monitor.check().await);
    assert_eq!(monitor.state(), NetworkState::Online);
  }

  #[tokio::test]
  async fn test_run_syncs_on_reconnect_and_stops_on_shutdown() {
    let network = MockNetwork::new();
    network.respond("https://erp.local/api/health", Response::new(200, "ok"));
    network.respond("https://erp.local/api/clients", Response::new(201, "{}"));

    let store = OfflineStore::new(Arc::new(Database::open_in_memory().unwrap())).unwrap();
    store
      .add_pending_sync(&NewOperation::new(
        OperationKind::Create,
        Method::Post,
        "https://erp.local/api/clients",
      ))
      .unwrap();
    let reconciler = Reconciler::new(
      store.clone(),
      Arc::new(network.clone()),
      RetryPolicy::default(),
    );
    let monitor = monitor(&network);

    monitor
      .run(
        &reconciler,
        Duration::from_secs(60),
        tokio::time::sleep(Duration::from_millis(200)),
      )
      .await;

    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(network.request_count("https://erp.local/api/clients"), 1);
  }
}
