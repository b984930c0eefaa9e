//! Response cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::{format_datetime, parse_datetime, Database};
use crate::http::{Request, Response};

/// A cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for response cache backends. Responses live in named caches and
/// are keyed by request.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store (or replace) the response for a request in `cache_name`.
  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up the response for a request in `cache_name`.
  fn match_request(&self, cache_name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Delete a whole cache. Returns the number of entries removed.
  fn delete_cache(&self, cache_name: &str) -> Result<usize>;

  /// Names of all caches that hold at least one entry.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// URLs stored in a cache.
  fn keys(&self, cache_name: &str) -> Result<Vec<String>>;
}

/// Stable key for a request: method and URL, fragment stripped.
pub fn request_key(request: &Request) -> String {
  let url = request.url.split('#').next().unwrap_or(&request.url);
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// SQLite-based response cache.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (cache_name, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          cache_name,
          request_key(request),
          request.url,
          response.status,
          headers,
          response.body,
          format_datetime(Utc::now())
        ],
      )
      .map_err(|e| eyre!("Failed to store response: {}", e))?;

    Ok(())
  }

  fn match_request(&self, cache_name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM response_cache
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, request_key(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query response cache: {}", e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM response_cache WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM response_cache ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn keys(&self, cache_name: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT url FROM response_cache WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache_name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(urls)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn test_put_then_match() {
    let storage = storage();
    let req = Request::get("https://erp.local/icons/logo.png");
    let resp = Response::new(200, vec![1, 2, 3]).with_header("Content-Type", "image/png");

    storage.put("erp-static-v1", &req, &resp).unwrap();

    let cached = storage.match_request("erp-static-v1", &req).unwrap().unwrap();
    assert_eq!(cached.response, resp);
    assert!(storage.match_request("erp-runtime-v1", &req).unwrap().is_none());
  }

  #[test]
  fn test_key_ignores_fragment_but_not_method() {
    let a = Request::get("https://erp.local/page#top");
    let b = Request::get("https://erp.local/page");
    let c = Request::new(Method::Head, "https://erp.local/page");
    assert_eq!(request_key(&a), request_key(&b));
    assert_ne!(request_key(&b), request_key(&c));
  }

  #[test]
  fn test_delete_cache_only_touches_named_cache() {
    let storage = storage();
    let req = Request::get("https://erp.local/");
    storage.put("erp-static-v1", &req, &Response::new(200, "a")).unwrap();
    storage.put("erp-static-v2", &req, &Response::new(200, "b")).unwrap();

    assert_eq!(storage.delete_cache("erp-static-v1").unwrap(), 1);
    assert_eq!(storage.cache_names().unwrap(), vec!["erp-static-v2"]);
    assert_eq!(storage.keys("erp-static-v2").unwrap(), vec!["https://erp.local/"]);
  }
}
