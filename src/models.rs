//! Snapshots of server records kept for offline reads.
//!
//! Only the fields the point of sale reads are typed; everything else the
//! API returns is carried along in `extra` so a cached copy round-trips.

use serde::{Deserialize, Serialize};

use crate::cache::Cacheable;
use crate::store::StoreName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub sku: Option<String>,
  pub price: f64,
  #[serde(default)]
  pub stock: Option<f64>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub rfc: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
  pub product_id: String,
  #[serde(default)]
  pub warehouse_id: Option<String>,
  pub quantity: f64,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigValue {
  pub key: String,
  pub value: serde_json::Value,
}

impl Cacheable for Product {
  fn cache_key(&self) -> String {
    self.id.clone()
  }
}

impl Cacheable for Client {
  fn cache_key(&self) -> String {
    self.id.clone()
  }
}

impl Cacheable for InventoryItem {
  fn cache_key(&self) -> String {
    // One row per product and warehouse
    match &self.warehouse_id {
      Some(warehouse) => format!("{}@{}", self.product_id, warehouse),
      None => self.product_id.clone(),
    }
  }
}

impl Cacheable for ConfigValue {
  fn cache_key(&self) -> String {
    self.key.clone()
  }
}

/// Untyped records go in the generic store keyed by their `id` field. A
/// record without one has an empty key, which the store rejects.
impl Cacheable for serde_json::Value {
  fn cache_key(&self) -> String {
    match self.get("id") {
      Some(serde_json::Value::String(s)) => s.clone(),
      Some(other) => other.to_string(),
      None => String::new(),
    }
  }
}

/// Entity type that has a dedicated store and API collection.
pub trait Collection: Cacheable {
  const STORE: StoreName;
  /// Path of the list endpoint
  const PATH: &'static str;
}

impl Collection for Product {
  const STORE: StoreName = StoreName::Products;
  const PATH: &'static str = "/api/products";
}

impl Collection for Client {
  const STORE: StoreName = StoreName::Clients;
  const PATH: &'static str = "/api/clients";
}

impl Collection for InventoryItem {
  const STORE: StoreName = StoreName::Inventory;
  const PATH: &'static str = "/api/inventory";
}

impl Collection for ConfigValue {
  const STORE: StoreName = StoreName::Config;
  const PATH: &'static str = "/api/config";
}
