//! Worker lifecycle: install, activate, messages, push and background sync.

mod push;

pub use push::{Notification, NotificationAction, PushPayload};

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CacheStorage, Cleanup};
use crate::config::Config;
use crate::http::{resolve, Request, Response};
use crate::network::Network;
use crate::router::Router;
use crate::sync::{Reconciler, SyncOutcome, SyncTrigger};

/// Background sync tag that drains the queue.
pub const SYNC_TAG: &str = "sync-data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Waiting,
  Active,
}

/// Message from a page: `{ "type": ..., "payload"?: ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SkipWaiting,
  CacheUrls(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageReply {
  /// Whether this message moved the worker to `Active`
  Activated(bool),
  /// Number of URLs stored in the runtime cache
  Cached(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: usize,
  pub failed: Vec<String>,
  /// Old cache generations deleted on activation
  pub removed: Vec<String>,
}

pub struct Worker<S: CacheStorage, N: Network> {
  router: Router<S, N>,
  reconciler: Reconciler<N>,
  origin: String,
  precache: Vec<String>,
  app_name: String,
  state: Mutex<WorkerState>,
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn new(config: &Config, router: Router<S, N>, reconciler: Reconciler<N>) -> Self {
    Self {
      router,
      reconciler,
      origin: config.origin.clone(),
      precache: config.routes.precache.clone(),
      app_name: config.app_name.clone(),
      state: Mutex::new(WorkerState::Installing),
    }
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(WorkerState::Installing)
  }

  fn set_state(&self, state: WorkerState) {
    if let Ok(mut current) = self.state.lock() {
      *current = state;
    }
  }

  pub fn router(&self) -> &Router<S, N> {
    &self.router
  }

  pub fn reconciler(&self) -> &Reconciler<N> {
    &self.reconciler
  }

  /// Fill the static cache with the precache list, then activate without
  /// waiting. Individual assets may fail; an install where every asset
  /// fails is an error and leaves the worker installing.
  pub async fn install(&self) -> Result<InstallReport> {
    self.set_state(WorkerState::Installing);
    let cache = self.router.names().static_assets();

    let requests = self
      .precache
      .iter()
      .map(|path| resolve(&self.origin, path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let (cached, failed) = self.fetch_into(&cache, &requests).await;
    if cached == 0 && !requests.is_empty() {
      return Err(eyre!(
        "Install failed: none of the {} precache URLs could be fetched",
        requests.len()
      ));
    }
    info!(cache = %cache, cached, failed = failed.len(), "precache complete");

    self.set_state(WorkerState::Waiting);
    let removed = self.activate()?;

    Ok(InstallReport {
      cached,
      failed,
      removed,
    })
  }

  /// Delete cache generations that don't match the current versions and
  /// take over. Returns the deleted cache names.
  pub fn activate(&self) -> Result<Vec<String>> {
    let storage = self.router.layer().storage();
    let mut removed = Vec::new();

    for name in storage.cache_names()? {
      match self.router.names().cleanup_for(&name) {
        Cleanup::Keep => continue,
        Cleanup::DeleteOutdated => info!(cache = %name, "deleting outdated cache"),
        Cleanup::DeleteNewer => warn!(cache = %name, "deleting cache newer than this version"),
      }
      storage.delete_cache(&name)?;
      removed.push(name);
    }

    self.set_state(WorkerState::Active);
    debug!(removed = removed.len(), "worker active");
    Ok(removed)
  }

  /// Route a request.
  pub async fn fetch(&self, request: &Request) -> CacheResult<Response> {
    self.router.handle(request).await
  }

  pub async fn handle_message(&self, message: WorkerMessage) -> Result<MessageReply> {
    match message {
      WorkerMessage::SkipWaiting => {
        if self.state() == WorkerState::Waiting {
          self.activate()?;
          Ok(MessageReply::Activated(true))
        } else {
          Ok(MessageReply::Activated(false))
        }
      }
      WorkerMessage::CacheUrls(urls) => {
        let requests = urls
          .iter()
          .map(|url| resolve(&self.origin, url).map(Request::get))
          .collect::<Result<Vec<_>>>()?;
        let (cached, _) = self
          .fetch_into(&self.router.names().runtime(), &requests)
          .await;
        Ok(MessageReply::Cached(cached))
      }
    }
  }

  /// Parse a raw message as posted by a page.
  pub fn parse_message(raw: &str) -> Result<WorkerMessage> {
    serde_json::from_str(raw).map_err(|e| eyre!("Invalid worker message: {}", e))
  }

  /// Build the notification for a push event.
  pub fn handle_push(&self, data: Option<&str>) -> Notification {
    Notification::from_payload(data.map(PushPayload::from_data), &self.app_name)
  }

  /// Resolve the navigation target for a notification click.
  pub fn notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> Result<Option<String>> {
    notification
      .click(action)
      .map(|target| resolve(&self.origin, target))
      .transpose()
  }

  /// Background sync event. Only [`SYNC_TAG`] is handled.
  pub async fn handle_sync(&self, tag: &str) -> Option<SyncOutcome> {
    if tag != SYNC_TAG {
      debug!(tag, "ignoring unknown sync tag");
      return None;
    }
    Some(
      self
        .reconciler
        .sync_pending_operations(SyncTrigger::BackgroundSync)
        .await,
    )
  }

  /// Fetch requests concurrently and store the ok ones in `cache`.
  async fn fetch_into(&self, cache: &str, requests: &[Request]) -> (usize, Vec<String>) {
    let network = self.router.layer().network();
    let responses = join_all(requests.iter().map(|req| network.fetch(req))).await;

    let mut cached = 0;
    let mut failed = Vec::new();
    for (request, response) in requests.iter().zip(responses) {
      match response {
        Ok(response) if response.is_ok() => {
          self.router.layer().store(cache, request, &response);
          cached += 1;
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "not caching non-ok response");
          failed.push(request.url.clone());
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "failed to fetch for cache");
          failed.push(request.url.clone());
        }
      }
    }

    (cached, failed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::db::Database;
  use crate::http::Method;
  use crate::store::{NewOperation, OfflineStore, OperationKind};
  use crate::sync::RetryPolicy;
  use crate::test_support::MockNetwork;
  use std::sync::Arc;

  const ORIGIN: &str = "https://erp.local";

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn worker_with(config: Config) -> (Worker<SqliteStorage, MockNetwork>, MockNetwork, OfflineStore) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let store = OfflineStore::new(db).unwrap();
    let router = Router::new(&config, storage, Arc::clone(&network)).unwrap();
    let reconciler = Reconciler::new(store.clone(), Arc::clone(&network), RetryPolicy::default());
    let worker = Worker::new(&config, router, reconciler);
    (worker, (*network).clone(), store)
  }

  fn worker() -> (Worker<SqliteStorage, MockNetwork>, MockNetwork, OfflineStore) {
    worker_with(Config::with_origin(ORIGIN))
  }

  fn serve_shell(network: &MockNetwork) {
    network.respond(&url("/"), Response::new(200, "<html>home</html>"));
    network.respond(&url("/offline"), Response::new(200, "<html>offline</html>"));
    network.respond(&url("/manifest.json"), Response::new(200, "{}"));
  }

  #[tokio::test]
  async fn test_install_precaches_then_serves_offline_page_from_cache() {
    let (worker, network, _) = worker();
    serve_shell(&network);

    let report = worker.install().await.unwrap();
    assert_eq!(report.cached, 3);
    assert!(report.failed.is_empty());
    assert_eq!(worker.state(), WorkerState::Active);

    let before = network.requests().len();
    let result = worker.fetch(&Request::navigation(url("/offline"))).await;
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.text(), "<html>offline</html>");
    assert_eq!(network.requests().len(), before);
  }

  #[tokio::test]
  async fn test_install_tolerates_some_failures() {
    let (worker, network, _) = worker();
    network.respond(&url("/offline"), Response::new(200, "offline"));
    network.respond(&url("/manifest.json"), Response::new(404, ""));

    let report = worker.install().await.unwrap();
    assert_eq!(report.cached, 1);
    assert_eq!(report.failed.len(), 2);
  }

  #[tokio::test]
  async fn test_install_with_no_network_fails() {
    let (worker, network, _) = worker();
    network.set_offline(true);
    assert!(worker.install().await.is_err());
    assert_eq!(worker.state(), WorkerState::Installing);
  }

  #[tokio::test]
  async fn test_activate_removes_old_generations_only() {
    let mut config = Config::with_origin(ORIGIN);
    config.caches.static_assets = 2;
    let (worker, network, _) = worker_with(config);
    serve_shell(&network);

    let storage = worker.router().layer().storage();
    let req = Request::get(url("/old.js"));
    storage.put("erp-static-v1", &req, &Response::new(200, "old")).unwrap();
    storage.put("erp-data-v1", &req, &Response::new(200, "current")).unwrap();
    storage.put("thirdparty-cache", &req, &Response::new(200, "x")).unwrap();

    let report = worker.install().await.unwrap();
    assert_eq!(report.removed, vec!["erp-static-v1"]);

    let names = storage.cache_names().unwrap();
    assert_eq!(names, vec!["erp-data-v1", "erp-static-v2", "thirdparty-cache"]);
  }

  #[tokio::test]
  async fn test_messages() {
    let (worker, network, _) = worker();
    network.respond(&url("/dashboard"), Response::new(200, "dash"));
    network.respond(&url("/pos"), Response::new(200, "pos"));

    let message = Worker::<SqliteStorage, MockNetwork>::parse_message(
      r#"{"type":"CACHE_URLS","payload":["/dashboard","/pos","/missing"]}"#,
    )
    .unwrap();
    assert_eq!(
      worker.handle_message(message).await.unwrap(),
      MessageReply::Cached(2)
    );
    assert_eq!(
      worker
        .router()
        .layer()
        .storage()
        .keys(&worker.router().names().runtime())
        .unwrap()
        .len(),
      2
    );

    let skip =
      Worker::<SqliteStorage, MockNetwork>::parse_message(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(skip, WorkerMessage::SkipWaiting);
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_waiting_worker() {
    let (worker, _, _) = worker();
    worker.set_state(WorkerState::Waiting);
    assert_eq!(
      worker.handle_message(WorkerMessage::SkipWaiting).await.unwrap(),
      MessageReply::Activated(true)
    );
    assert_eq!(worker.state(), WorkerState::Active);
    assert_eq!(
      worker.handle_message(WorkerMessage::SkipWaiting).await.unwrap(),
      MessageReply::Activated(false)
    );
  }

  #[tokio::test]
  async fn test_push_then_open_navigates() {
    let (worker, _, _) = worker();
    let notification = worker.handle_push(Some(r#"{"title":"X","body":"Y","url":"/z"}"#));
    assert_eq!(notification.title, "X");

    let target = worker.notification_click(&notification, Some("open")).unwrap();
    assert_eq!(target.as_deref(), Some("https://erp.local/z"));
    assert_eq!(worker.notification_click(&notification, Some("close")).unwrap(), None);
  }

  #[tokio::test]
  async fn test_sync_tag() {
    let (worker, network, store) = worker();
    store
      .add_pending_sync(&NewOperation::new(
        OperationKind::Update,
        Method::Put,
        url("/api/products/1"),
      ))
      .unwrap();
    network.respond(&url("/api/products/1"), Response::new(200, "{}"));

    assert!(worker.handle_sync("other-tag").await.is_none());
    assert_eq!(store.pending_count().unwrap(), 1);

    let outcome = worker.handle_sync(SYNC_TAG).await.unwrap();
    assert_eq!(outcome.success, 1);
    assert_eq!(store.pending_count().unwrap(), 0);
  }
}
