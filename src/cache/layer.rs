//! Cache layer that implements the fetch strategies on top of a storage
//! backend and a network.

use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CacheStorage, CachedResponse};
use super::traits::CacheResult;
use crate::http::{Request, Response};
use crate::network::Network;

/// Cache layer that manages caching logic and network fetching.
///
/// Every strategy returns `None` when neither the network nor the cache
/// could answer; picking the fallback response is up to the caller.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self { storage, network }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  /// Always hit the network. Nothing is read from or written to a cache.
  pub async fn network_only(&self, request: &Request) -> Option<CacheResult<Response>> {
    match self.network.fetch(request).await {
      Ok(response) => Some(CacheResult::from_network(response)),
      Err(e) => {
        debug!(url = %request.url, error = %e, "network-only request failed");
        None
      }
    }
  }

  /// Serve from `cache_name` when present, otherwise fetch and populate.
  pub async fn cache_first(
    &self,
    cache_name: &str,
    request: &Request,
  ) -> Option<CacheResult<Response>> {
    if let Some(cached) = self.lookup(cache_name, request) {
      return Some(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(cache_name, request, &response);
        Some(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "cache-first miss and network failed");
        None
      }
    }
  }

  /// Prefer the network, keeping a copy in `cache_name`; fall back to the
  /// cached copy when the network fails.
  pub async fn network_first(
    &self,
    cache_name: &str,
    request: &Request,
  ) -> Option<CacheResult<Response>> {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(cache_name, request, &response);
        Some(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, trying cache");
        self
          .lookup(cache_name, request)
          .map(|cached| CacheResult::offline(cached.response, cached.cached_at))
      }
    }
  }

  /// Answer from cache immediately and refresh it in the background; without
  /// a cached copy, wait for the network.
  pub async fn stale_while_revalidate(
    &self,
    cache_name: &str,
    request: &Request,
  ) -> Option<CacheResult<Response>> {
    if let Some(cached) = self.lookup(cache_name, request) {
      let storage = Arc::clone(&self.storage);
      let network = Arc::clone(&self.network);
      let cache_name = cache_name.to_string();
      let request = request.clone();

      let handle = tokio::spawn(async move {
        match network.fetch(&request).await {
          Ok(response) => store_ok(storage.as_ref(), &cache_name, &request, &response),
          Err(e) => debug!(url = %request.url, error = %e, "background revalidation failed"),
        }
      });

      return Some(
        CacheResult::from_cache(cached.response, cached.cached_at).with_revalidation(handle),
      );
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(cache_name, request, &response);
        Some(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "no cached copy and network failed");
        None
      }
    }
  }

  /// Cache lookup that treats a storage failure as a miss.
  pub fn lookup(&self, cache_name: &str, request: &Request) -> Option<CachedResponse> {
    match self.storage.match_request(cache_name, request) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(cache = cache_name, url = %request.url, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Store a response if it is ok; non-ok responses are never cached.
  pub fn store(&self, cache_name: &str, request: &Request, response: &Response) {
    store_ok(self.storage.as_ref(), cache_name, request, response);
  }
}

fn store_ok<S: CacheStorage>(storage: &S, cache_name: &str, request: &Request, response: &Response) {
  if !response.is_ok() {
    return;
  }
  if let Err(e) = storage.put(cache_name, request, response) {
    warn!(cache = cache_name, url = %request.url, error = %e, "cache write failed");
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
    }
  }
}
