//! Minimal request/response model shared by the router, the caches and the
//! sync queue.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// An outgoing request as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// True for top-level page navigations (these get the offline page).
  pub navigate: bool,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      url: url.into(),
      headers: Vec::new(),
      body: None,
      navigate: false,
    }
  }

  pub fn navigation(url: impl Into<String>) -> Self {
    Self {
      navigate: true,
      ..Self::get(url)
    }
  }

  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Only http(s) requests are routed; anything else passes through.
  pub fn is_http(&self) -> bool {
    match Url::parse(&self.url) {
      Ok(url) => matches!(url.scheme(), "http" | "https"),
      Err(_) => false,
    }
  }

  /// Path component of the URL, or the raw URL when it does not parse.
  pub fn path(&self) -> String {
    Url::parse(&self.url)
      .map(|u| u.path().to_string())
      .unwrap_or_else(|_| self.url.clone())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Synthetic response for a cache-first miss with no network.
  pub fn offline_text() -> Self {
    Self::new(503, "Offline").with_header("Content-Type", "text/plain")
  }

  /// Synthetic response for an API request that has neither network nor cache.
  pub fn offline_json() -> Self {
    Self::new(503, r#"{"error":"Offline"}"#).with_header("Content-Type", "application/json")
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }
}

/// Resolve a path (or absolute URL) against the configured origin.
pub fn resolve(origin: &str, path_or_url: &str) -> Result<String> {
  if let Ok(absolute) = Url::parse(path_or_url) {
    return Ok(absolute.to_string());
  }
  let base = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
  base
    .join(path_or_url)
    .map(|u| u.to_string())
    .map_err(|e| eyre!("Invalid path {}: {}", path_or_url, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_http() {
    assert!(Request::get("https://erp.local/api/products").is_http());
    assert!(Request::get("http://erp.local/").is_http());
    assert!(!Request::get("chrome-extension://abc/script.js").is_http());
    assert!(!Request::get("/relative").is_http());
  }

  #[test]
  fn test_path() {
    let req = Request::get("https://erp.local/api/products?page=2");
    assert_eq!(req.path(), "/api/products");
  }

  #[test]
  fn test_is_ok_range() {
    assert!(Response::new(200, "").is_ok());
    assert!(Response::new(204, "").is_ok());
    assert!(!Response::new(304, "").is_ok());
    assert!(!Response::new(503, "").is_ok());
  }

  #[test]
  fn test_synthetic_responses() {
    let text = Response::offline_text();
    assert_eq!(text.status, 503);
    assert_eq!(text.text(), "Offline");

    let json = Response::offline_json();
    assert_eq!(json.status, 503);
    assert_eq!(json.header("content-type"), Some("application/json"));
    let value: serde_json::Value = json.json().unwrap();
    assert_eq!(value["error"], "Offline");
  }

  #[test]
  fn test_method_parse() {
    assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[test]
  fn test_resolve() {
    assert_eq!(
      resolve("https://erp.local", "/offline").unwrap(),
      "https://erp.local/offline"
    );
    assert_eq!(
      resolve("https://erp.local", "https://cdn.local/a.png").unwrap(),
      "https://cdn.local/a.png"
    );
  }
}
