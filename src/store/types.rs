//! Records kept in the offline store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::http::{Method, Request};

/// Logical entity stores. Pending operations and sales are kept apart from
/// these, so clearing one never touches the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
  Products,
  Clients,
  Inventory,
  Config,
  /// Anything that doesn't have a dedicated store
  Entities,
}

impl StoreName {
  pub const ALL: [StoreName; 5] = [
    StoreName::Products,
    StoreName::Clients,
    StoreName::Inventory,
    StoreName::Config,
    StoreName::Entities,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      StoreName::Products => "products",
      StoreName::Clients => "clients",
      StoreName::Inventory => "inventory",
      StoreName::Config => "config",
      StoreName::Entities => "entities",
    }
  }
}

impl fmt::Display for StoreName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for StoreName {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|store| store.as_str() == s)
      .ok_or_else(|| eyre!("Unknown store '{}'", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
  Sale,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
      OperationKind::Sale => "sale",
    }
  }
}

impl FromStr for OperationKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "create" => Ok(OperationKind::Create),
      "update" => Ok(OperationKind::Update),
      "delete" => Ok(OperationKind::Delete),
      "sale" => Ok(OperationKind::Sale),
      other => Err(eyre!("Unknown operation kind '{}'", other)),
    }
  }
}

/// Lifecycle of a queued write.
///
/// `Pending -> InFlight -> Synced` on success; `InFlight -> Pending` on a
/// retryable failure; `InFlight -> Failed` once retries are exhausted or the
/// server rejected the request outright. `Synced` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
  Pending,
  InFlight,
  Synced,
  Failed,
}

impl OperationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationStatus::Pending => "pending",
      OperationStatus::InFlight => "in_flight",
      OperationStatus::Synced => "synced",
      OperationStatus::Failed => "failed",
    }
  }
}

impl FromStr for OperationStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(OperationStatus::Pending),
      "in_flight" => Ok(OperationStatus::InFlight),
      "synced" => Ok(OperationStatus::Synced),
      "failed" => Ok(OperationStatus::Failed),
      other => Err(eyre!("Unknown operation status '{}'", other)),
    }
  }
}

/// A write to queue: the `{method, url, headers?, body}` triple plus a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
  pub kind: OperationKind,
  pub method: Method,
  pub url: String,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  pub body: Option<serde_json::Value>,
}

impl NewOperation {
  pub fn new(kind: OperationKind, method: Method, url: impl Into<String>) -> Self {
    Self {
      kind,
      method,
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn with_body(mut self, body: serde_json::Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn to_request(&self) -> Request {
    build_request(self.method, &self.url, &self.headers, self.body.as_ref())
  }
}

/// A queued write as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
  pub id: i64,
  pub kind: OperationKind,
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<serde_json::Value>,
  /// Offline sale this operation carries, if any
  pub sale_id: Option<String>,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  pub synced_at: Option<DateTime<Utc>>,
  pub status: OperationStatus,
  /// Server-side failures so far (network errors are not counted)
  pub attempts: u32,
  pub last_error: Option<String>,
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
  /// The HTTP request that replays this operation.
  pub fn to_request(&self) -> Request {
    build_request(self.method, &self.url, &self.headers, self.body.as_ref())
  }
}

fn build_request(
  method: Method,
  url: &str,
  headers: &[(String, String)],
  body: Option<&serde_json::Value>,
) -> Request {
  let mut request = Request::new(method, url);
  request.headers = headers.to_vec();

  if let Some(body) = body {
    let has_content_type = headers
      .iter()
      .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
    if !has_content_type {
      request
        .headers
        .push(("Content-Type".to_string(), "application/json".to_string()));
    }
    request.body = Some(body.to_string().into_bytes());
  }

  request
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
  pub product_id: String,
  pub quantity: f64,
  pub unit_price: f64,
}

/// A point-of-sale ticket recorded while the server could not confirm it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
  pub id: String,
  pub items: Vec<SaleItem>,
  pub total: f64,
  pub payment_method: String,
  #[serde(default)]
  pub client_id: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub synced: bool,
  #[serde(default)]
  pub synced_at: Option<DateTime<Utc>>,
  /// Fields the POS sends that this crate doesn't interpret
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Sale {
  pub fn new(items: Vec<SaleItem>, payment_method: impl Into<String>) -> Self {
    let total = items.iter().map(|i| i.quantity * i.unit_price).sum();
    Self {
      id: offline_id(),
      items,
      total,
      payment_method: payment_method.into(),
      client_id: None,
      created_at: Utc::now(),
      synced: false,
      synced_at: None,
      extra: serde_json::Map::new(),
    }
  }
}

/// Local id for a record the server hasn't assigned one to yet:
/// `offline-<unix millis>-<random base36>`.
pub fn offline_id() -> String {
  const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
  let mut rng = rand::thread_rng();
  let suffix: String = (0..9)
    .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
    .collect();
  format!("offline-{}-{}", Utc::now().timestamp_millis(), suffix)
}
