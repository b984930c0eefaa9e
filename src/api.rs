//! Offline-aware API client.
//!
//! Reads go through the router and fall back to the entity stores; writes
//! are sent right away when possible and queued for the reconciler
//! otherwise.

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use crate::cache::{CacheSource, CacheStorage};
use crate::config::Config;
use crate::http::{resolve, Method, Request};
use crate::models::{Client, Collection, ConfigValue, InventoryItem, Product};
use crate::network::Network;
use crate::router::Router;
use crate::store::{NewOperation, OfflineStore, OperationKind, Sale};

/// Entities from a collection endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
  pub items: Vec<T>,
  /// Served from the local store because the server was unreachable
  pub offline: bool,
}

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
  /// The server accepted it
  Sent,
  /// Queued as the given pending operation
  Queued(i64),
}

/// Client for the ERP API that keeps working offline.
pub struct OfflineApi<S: CacheStorage, N: Network> {
  router: Router<S, N>,
  store: OfflineStore,
  origin: String,
  sales_endpoint: String,
}

impl<S: CacheStorage, N: Network> OfflineApi<S, N> {
  pub fn new(config: &Config, router: Router<S, N>, store: OfflineStore) -> Self {
    Self {
      router,
      store,
      origin: config.origin.clone(),
      sales_endpoint: config.sync.sales_endpoint.clone(),
    }
  }

  pub async fn load_products(&self) -> Result<Loaded<Product>> {
    self.load().await
  }

  pub async fn load_clients(&self) -> Result<Loaded<Client>> {
    self.load().await
  }

  pub async fn load_inventory(&self) -> Result<Loaded<InventoryItem>> {
    self.load().await
  }

  pub async fn load_config(&self) -> Result<Loaded<ConfigValue>> {
    self.load().await
  }

  /// Fetch a collection. Fresh server data replaces the local copy entry
  /// by entry; anything else falls back to what the store holds.
  pub async fn load<T: Collection>(&self) -> Result<Loaded<T>> {
    let request = Request::get(resolve(&self.origin, T::PATH)?);
    let result = self.router.handle(&request).await;

    if result.source == CacheSource::Network && result.data.is_ok() {
      match result.data.json::<Vec<T>>() {
        Ok(items) => {
          self.store.save_all_to_cache(T::STORE, &items)?;
          debug!(store = %T::STORE, count = items.len(), "refreshed local store");
          return Ok(Loaded {
            items,
            offline: false,
          });
        }
        Err(e) => warn!(url = %request.url, error = %e, "unexpected collection payload"),
      }
    } else {
      debug!(
        url = %request.url,
        source = result.source.label(),
        status = result.data.status,
        "serving collection from local store"
      );
    }

    Ok(Loaded {
      items: self.store.get_all_from_cache(T::STORE)?,
      offline: true,
    })
  }

  /// Send a write now, or queue it when the server can't take it.
  /// Client errors (4xx) are returned, not queued.
  pub async fn submit(&self, operation: NewOperation) -> Result<Submitted> {
    let operation = NewOperation {
      url: resolve(&self.origin, &operation.url)?,
      ..operation
    };

    if self.try_send(&operation.to_request()).await? {
      return Ok(Submitted::Sent);
    }

    let id = self.store.add_pending_sync(&operation)?;
    info!(op_id = id, url = %operation.url, "write queued for sync");
    Ok(Submitted::Queued(id))
  }

  /// Post a sale, or keep it locally with its queued POST.
  pub async fn record_sale(&self, sale: Sale) -> Result<Submitted> {
    let endpoint = resolve(&self.origin, &self.sales_endpoint)?;
    let body = serde_json::to_value(&sale).map_err(|e| eyre!("Failed to serialize sale: {}", e))?;
    let operation = NewOperation::new(OperationKind::Sale, Method::Post, endpoint.as_str()).with_body(body);

    if self.try_send(&operation.to_request()).await? {
      return Ok(Submitted::Sent);
    }

    let id = self.store.save_offline_sale(&sale, &endpoint)?;
    Ok(Submitted::Queued(id))
  }

  /// True when the server accepted the request, false when it should be
  /// retried later.
  async fn try_send(&self, request: &Request) -> Result<bool> {
    match self.router.layer().network().fetch(request).await {
      Ok(response) if response.is_ok() => Ok(true),
      Ok(response) if response.status >= 500 => {
        debug!(url = %request.url, status = response.status, "server error, queueing");
        Ok(false)
      }
      Ok(response) => Err(eyre!(
        "{} {} rejected with HTTP {}: {}",
        request.method,
        request.url,
        response.status,
        response.text()
      )),
      Err(e) => {
        debug!(url = %request.url, error = %e, "network unavailable, queueing");
        Ok(false)
      }
    }
  }
}
