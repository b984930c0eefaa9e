//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;

/// Trait for entities that can be stored in the offline entity caches.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity (e.g., product id, config key)
  fn cache_key(&self) -> String;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background refresh started for a stale-while-revalidate hit
  pub revalidation: Option<JoinHandle<()>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      revalidation: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      revalidation: None,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      revalidation: None,
    }
  }

  /// A response made up locally (offline page, synthetic 503).
  pub fn synthetic(data: T, source: CacheSource) -> Self {
    Self {
      data,
      source,
      cached_at: None,
      revalidation: None,
    }
  }

  pub fn with_revalidation(mut self, handle: JoinHandle<()>) -> Self {
    self.revalidation = Some(handle);
    self
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache without waiting for the network
  Cache,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline page served in place of a navigation
  OfflinePage,
  /// Locally built error response (503)
  Synthetic,
  /// Request not handled by the router (non-HTTP scheme)
  Passthrough,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "cache (offline)",
      CacheSource::OfflinePage => "offline page",
      CacheSource::Synthetic => "synthetic",
      CacheSource::Passthrough => "passthrough",
    }
  }
}
