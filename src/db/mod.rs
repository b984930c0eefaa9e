pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Shared SQLite handle for the response caches and the offline store.
///
/// One `Database` is opened per process and handed to the components that
/// need it; there is no global instance.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, running pending migrations.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    debug!(path = %path.display(), "database opened");

    Ok(db)
  }

  /// Open a private in-memory database (tests and dry runs).
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("erp-offline").join("offline.db"))
  }

  /// Lock the connection.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Current schema version.
  pub fn version(&self) -> Result<i64> {
    let conn = self.conn()?;
    user_version(&conn)
  }

  fn run_migrations(&self) -> Result<()> {
    let mut conn = self.conn()?;
    migrate_to(&mut conn, schema::latest_version())
  }
}

fn user_version(conn: &Connection) -> Result<i64> {
  conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))
}

/// Apply migrations until the schema is at `target`. Each step runs in its
/// own transaction together with the version bump.
pub(crate) fn migrate_to(conn: &mut Connection, target: i64) -> Result<()> {
  let current = user_version(conn)?;

  for (index, sql) in schema::MIGRATIONS.iter().enumerate() {
    let version = index as i64 + 1;
    if version <= current || version > target {
      continue;
    }

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin migration: {}", e))?;
    tx.execute_batch(sql)
      .map_err(|e| eyre!("Failed to run migration v{}: {}", version, e))?;
    tx.pragma_update(None, "user_version", version)
      .map_err(|e| eyre!("Failed to record schema version {}: {}", version, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit migration v{}: {}", version, e))?;

    info!(version, "applied schema migration");
  }

  Ok(())
}

/// Timestamp format used in every table. Fixed width, so string order is
/// time order.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_in_memory_is_at_latest_version() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.version().unwrap(), schema::latest_version());
  }

  #[test]
  fn test_reopen_does_not_rerun_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    drop(Database::open(&path).unwrap());
    let db = Database::open(&path).unwrap();
    assert_eq!(db.version().unwrap(), schema::latest_version());
  }

  #[test]
  fn test_v1_rows_survive_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    {
      let mut conn = Connection::open(&path).unwrap();
      migrate_to(&mut conn, 1).unwrap();
      conn
        .execute_batch(
          "INSERT INTO pending_sync (kind, method, url, created_at, synced, synced_at)
           VALUES ('update', 'PUT', 'https://erp.local/api/products/1', '2026-01-01T00:00:00.000Z', 1, '2026-01-01T00:01:00.000Z');
           INSERT INTO pending_sync (kind, method, url, created_at)
           VALUES ('create', 'POST', 'https://erp.local/api/clients', '2026-01-01T00:02:00.000Z');",
        )
        .unwrap();
    }

    let db = Database::open(&path).unwrap();
    let conn = db.conn().unwrap();
    let statuses: Vec<String> = conn
      .prepare("SELECT status FROM pending_sync ORDER BY id")
      .unwrap()
      .query_map([], |row| row.get(0))
      .unwrap()
      .collect::<std::result::Result<_, _>>()
      .unwrap();

    assert_eq!(statuses, vec!["synced", "pending"]);
  }

  #[test]
  fn test_datetime_roundtrip_and_order() {
    let earlier = Utc::now();
    let later = earlier + chrono::Duration::milliseconds(1500);
    let a = format_datetime(earlier);
    let b = format_datetime(later);
    assert!(a < b);
    assert_eq!(
      parse_datetime(&a).unwrap().timestamp_millis(),
      earlier.timestamp_millis()
    );
  }
}
