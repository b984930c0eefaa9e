//! Request classification and dispatch to the cache strategies.

use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheLayer, CacheNames, CacheResult, CacheSource, CacheStorage};
use crate::config::{Config, RoutesConfig};
use crate::http::{resolve, Method, Request, Response};
use crate::network::Network;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Not an http(s) request; left untouched
  Passthrough,
  NetworkOnly,
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// Classifies requests by path prefix. First match wins:
/// network-only, cache-first (prefixes and the exact precached paths), API
/// (network-first), everything else stale-while-revalidate. Non-GET
/// requests are never cached.
#[derive(Debug, Clone)]
pub struct RouteTable {
  network_only: Vec<String>,
  cache_first: Vec<String>,
  precached: Vec<String>,
  api_prefix: String,
}

impl RouteTable {
  pub fn from_config(routes: &RoutesConfig) -> Self {
    Self {
      network_only: routes.network_only.clone(),
      cache_first: routes.cache_first.clone(),
      precached: routes.precache.clone(),
      api_prefix: routes.api_prefix.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    if !request.is_http() {
      return Strategy::Passthrough;
    }
    if request.method != Method::Get {
      return Strategy::NetworkOnly;
    }

    let path = request.path();
    if self.network_only.iter().any(|p| path.starts_with(p.as_str())) {
      Strategy::NetworkOnly
    } else if self.cache_first.iter().any(|p| path.starts_with(p.as_str()))
      || self.precached.iter().any(|p| *p == path)
    {
      Strategy::CacheFirst
    } else if path.starts_with(self.api_prefix.as_str()) {
      Strategy::NetworkFirst
    } else {
      Strategy::StaleWhileRevalidate
    }
  }
}

/// Routes every request through the matching strategy and turns total
/// failures into the offline page or a synthetic 503.
pub struct Router<S: CacheStorage, N: Network> {
  layer: CacheLayer<S, N>,
  routes: RouteTable,
  names: CacheNames,
  offline_page: Request,
}

impl<S: CacheStorage, N: Network> Router<S, N> {
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> color_eyre::Result<Self> {
    let offline_url = resolve(&config.origin, &config.routes.offline_page)?;
    Ok(Self {
      layer: CacheLayer::new(storage, network),
      routes: RouteTable::from_config(&config.routes),
      names: CacheNames::from_config(&config.caches),
      offline_page: Request::get(offline_url),
    })
  }

  pub fn layer(&self) -> &CacheLayer<S, N> {
    &self.layer
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    self.routes.classify(request)
  }

  /// Serve a request. Passthrough requests go straight to the network
  /// (an unreachable network is reported as a synthetic 503).
  pub async fn handle(&self, request: &Request) -> CacheResult<Response> {
    let strategy = self.classify(request);
    debug!(url = %request.url, ?strategy, "routing request");

    match strategy {
      Strategy::Passthrough => match self.layer.network().fetch(request).await {
        Ok(response) => CacheResult::synthetic(response, CacheSource::Passthrough),
        Err(_) => CacheResult::synthetic(Response::offline_text(), CacheSource::Synthetic),
      },
      Strategy::NetworkOnly => self
        .layer
        .network_only(request)
        .await
        .unwrap_or_else(|| CacheResult::synthetic(Response::offline_json(), CacheSource::Synthetic)),
      Strategy::CacheFirst => self
        .layer
        .cache_first(&self.names.static_assets(), request)
        .await
        .unwrap_or_else(|| CacheResult::synthetic(Response::offline_text(), CacheSource::Synthetic)),
      Strategy::NetworkFirst => match self.layer.network_first(&self.names.data(), request).await {
        Some(result) => result,
        None => self.fallback(request, Response::offline_json()),
      },
      Strategy::StaleWhileRevalidate => {
        match self
          .layer
          .stale_while_revalidate(&self.names.runtime(), request)
          .await
        {
          Some(result) => result,
          None => self.fallback(request, Response::offline_text()),
        }
      }
    }
  }

  /// Offline page for navigations, `otherwise` for everything else.
  fn fallback(&self, request: &Request, otherwise: Response) -> CacheResult<Response> {
    if request.navigate {
      if let Some(page) = self.offline_page() {
        return CacheResult::synthetic(page, CacheSource::OfflinePage);
      }
    }
    CacheResult::synthetic(otherwise, CacheSource::Synthetic)
  }

  fn offline_page(&self) -> Option<Response> {
    [self.names.static_assets(), self.names.runtime()]
      .iter()
      .find_map(|cache| self.layer.lookup(cache, &self.offline_page))
      .map(|cached| cached.response)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::test_support::MockNetwork;

  const ORIGIN: &str = "https://erp.local";

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn router() -> (Router<SqliteStorage, MockNetwork>, MockNetwork, Arc<SqliteStorage>) {
    let config = Config::with_origin(ORIGIN);
    let storage = Arc::new(SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())));
    let network = MockNetwork::new();
    let router = Router::new(&config, Arc::clone(&storage), Arc::new(network.clone())).unwrap();
    (router, network, storage)
  }

  fn cached_entries(storage: &SqliteStorage) -> usize {
    storage
      .cache_names()
      .unwrap()
      .iter()
      .map(|name| storage.keys(name).unwrap().len())
      .sum()
  }

  #[test]
  fn test_classification_order() {
    let table = RouteTable::from_config(&RoutesConfig::default());
    assert_eq!(table.classify(&Request::get(url("/api/auth/login"))), Strategy::NetworkOnly);
    assert_eq!(table.classify(&Request::get(url("/api/sync/status"))), Strategy::NetworkOnly);
    assert_eq!(table.classify(&Request::get(url("/icons/icon-192.png"))), Strategy::CacheFirst);
    assert_eq!(table.classify(&Request::get(url("/_next/static/chunk.js"))), Strategy::CacheFirst);
    assert_eq!(table.classify(&Request::get(url("/api/products"))), Strategy::NetworkFirst);
    assert_eq!(table.classify(&Request::get(url("/offline"))), Strategy::CacheFirst);
    assert_eq!(table.classify(&Request::get(url("/"))), Strategy::CacheFirst);
    assert_eq!(table.classify(&Request::get(url("/dashboard"))), Strategy::StaleWhileRevalidate);
    assert_eq!(
      table.classify(&Request::get(url("/offline/extra"))),
      Strategy::StaleWhileRevalidate
    );
    assert_eq!(
      table.classify(&Request::get("chrome-extension://abc/content.js")),
      Strategy::Passthrough
    );
    assert_eq!(
      table.classify(&Request::new(Method::Post, url("/api/products"))),
      Strategy::NetworkOnly
    );
  }

  #[tokio::test]
  async fn test_network_only_never_touches_cache() {
    let (router, network, storage) = router();
    let req = Request::get(url("/api/auth/session"));
    network.respond(&req.url, Response::new(200, "{}"));

    let result = router.handle(&req).await;
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(cached_entries(&storage), 0);

    network.set_offline(true);
    let result = router.handle(&req).await;
    assert_eq!(result.source, CacheSource::Synthetic);
    assert_eq!(result.data.status, 503);
    assert_eq!(cached_entries(&storage), 0);
  }

  #[tokio::test]
  async fn test_cache_first_second_request_served_from_cache() {
    let (router, network, _) = router();
    let req = Request::get(url("/icons/logo.png"));
    network.respond_once(&req.url, Response::new(200, "png"));

    let first = router.handle(&req).await;
    assert_eq!(first.source, CacheSource::Network);

    let second = router.handle(&req).await;
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.text(), "png");
    assert_eq!(network.request_count(&req.url), 1);
  }

  #[tokio::test]
  async fn test_cache_first_total_failure_is_503_offline() {
    let (router, _network, _) = router();
    let result = router.handle(&Request::get(url("/images/missing.png"))).await;
    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.text(), "Offline");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cached_response() {
    let (router, network, _) = router();
    let req = Request::get(url("/api/products"));
    network.respond_once(&req.url, Response::new(200, "[1,2]"));

    assert_eq!(router.handle(&req).await.source, CacheSource::Network);

    network.set_offline(true);
    let result = router.handle(&req).await;
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.text(), "[1,2]");
  }

  #[tokio::test]
  async fn test_network_first_navigation_gets_offline_page() {
    let (router, network, storage) = router();
    storage
      .put(
        &router.names().static_assets(),
        &Request::get(url("/offline")),
        &Response::new(200, "<h1>Sin conexión</h1>"),
      )
      .unwrap();
    network.set_offline(true);

    let result = router.handle(&Request::navigation(url("/api/reports"))).await;
    assert_eq!(result.source, CacheSource::OfflinePage);
    assert_eq!(result.data.text(), "<h1>Sin conexión</h1>");

    let result = router.handle(&Request::get(url("/api/reports"))).await;
    assert_eq!(result.source, CacheSource::Synthetic);
    assert_eq!(result.data.status, 503);
    let body: serde_json::Value = result.data.json().unwrap();
    assert_eq!(body["error"], "Offline");
  }

  #[tokio::test]
  async fn test_uncached_page_offline_navigation_gets_offline_page() {
    let (router, network, storage) = router();
    storage
      .put(
        &router.names().static_assets(),
        &Request::get(url("/offline")),
        &Response::new(200, "<h1>Sin conexión</h1>"),
      )
      .unwrap();
    network.set_offline(true);

    let result = router.handle(&Request::navigation(url("/dashboard"))).await;
    assert_eq!(result.source, CacheSource::OfflinePage);
    assert_eq!(result.data.text(), "<h1>Sin conexión</h1>");
    assert!(result.revalidation.is_none());
  }

  #[tokio::test]
  async fn test_uncached_page_offline_get_is_503_text() {
    let (router, network, storage) = router();
    storage
      .put(
        &router.names().static_assets(),
        &Request::get(url("/offline")),
        &Response::new(200, "<h1>Sin conexión</h1>"),
      )
      .unwrap();
    network.set_offline(true);

    let result = router.handle(&Request::get(url("/dashboard"))).await;
    assert_eq!(result.source, CacheSource::Synthetic);
    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.text(), "Offline");
    assert!(storage.keys(&router.names().runtime()).unwrap_or_default().is_empty());
  }

  #[tokio::test]
  async fn test_passthrough_is_not_cached() {
    let (router, network, storage) = router();
    let req = Request::get("chrome-extension://abc/content.js");
    network.respond(&req.url, Response::new(200, "js"));

    let result = router.handle(&req).await;
    assert_eq!(result.source, CacheSource::Passthrough);
    assert_eq!(cached_entries(&storage), 0);
  }
}
