//! Durable local store: entity snapshots, the pending-operation queue and
//! offline sales.

mod types;

pub use types::{
  offline_id, NewOperation, OperationKind, OperationStatus, PendingOperation, Sale, SaleItem,
  StoreName,
};

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::Cacheable;
use crate::db::{format_datetime, parse_datetime, Database};

const OPERATION_COLUMNS: &str = "id, kind, method, url, headers, body, sale_id, created_at, \
   synced, synced_at, status, attempts, last_error, next_attempt_at";

/// Seconds a claim protects an operation before another sweep may take it
/// over.
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 600;

/// Handle to the offline store. Construct one per process and pass it to
/// whatever needs it.
///
/// Each handle (and its clones) claims operations under its own token, so
/// claims from another handle on the same file are never touched until
/// their lease runs out.
#[derive(Clone)]
pub struct OfflineStore {
  db: Arc<Database>,
  token: String,
  lease: Duration,
}

impl OfflineStore {
  pub fn new(db: Arc<Database>) -> Result<Self> {
    Self::with_claim_lease(db, Duration::seconds(DEFAULT_CLAIM_LEASE_SECS))
  }

  /// Wrap an opened database. Claims older than `lease` were left by a
  /// sweep that died and are put back in the queue.
  pub fn with_claim_lease(db: Arc<Database>, lease: Duration) -> Result<Self> {
    let store = Self {
      db,
      token: format!("{}:{:016x}", std::process::id(), rand::random::<u64>()),
      lease,
    };
    let released = store.release_expired_claims(Utc::now())?;
    if released > 0 {
      warn!(released, "requeued operations abandoned mid-sync");
    }
    Ok(store)
  }

  // ==========================================================================
  // Entity caches
  // ==========================================================================

  /// Insert or replace an entity in `store`.
  pub fn save_to_cache<T: Cacheable>(&self, store: StoreName, entity: &T) -> Result<()> {
    let key = entity_key(store, entity)?;
    let conn = self.db.conn()?;
    let data =
      serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entity_cache (store, entity_key, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![store.as_str(), key, data, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to store entity: {}", e))?;

    Ok(())
  }

  /// Insert or replace many entities in one transaction.
  pub fn save_all_to_cache<T: Cacheable>(&self, store: StoreName, entities: &[T]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let now = format_datetime(Utc::now());

    for entity in entities {
      let key = entity_key(store, entity)?;
      let data =
        serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO entity_cache (store, entity_key, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![store.as_str(), key, data, now],
      )
      .map_err(|e| eyre!("Failed to store entity: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    debug!(store = %store, count = entities.len(), "cached entities");

    Ok(())
  }

  pub fn get_from_cache<T: DeserializeOwned>(&self, store: StoreName, id: &str) -> Result<Option<T>> {
    let conn = self.db.conn()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM entity_cache WHERE store = ? AND entity_key = ?",
        params![store.as_str(), id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entity: {}", e))?;

    data
      .map(|data| {
        serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize entity: {}", e))
      })
      .transpose()
  }

  /// Every entity in `store`, ordered by key.
  pub fn get_all_from_cache<T: DeserializeOwned>(&self, store: StoreName) -> Result<Vec<T>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT data FROM entity_cache WHERE store = ? ORDER BY entity_key")
      .map_err(|e| eyre!("Failed to prepare entity query: {}", e))?;

    let rows = stmt
      .query_map(params![store.as_str()], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to query entities: {}", e))?;

    let mut entities = Vec::new();
    for data in rows {
      let data = data.map_err(|e| eyre!("Failed to read entity: {}", e))?;
      entities.push(
        serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize entity: {}", e))?,
      );
    }

    Ok(entities)
  }

  /// Remove one entity. Returns whether it existed.
  pub fn delete_from_cache(&self, store: StoreName, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM entity_cache WHERE store = ? AND entity_key = ?",
        params![store.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to delete entity: {}", e))?;
    Ok(removed > 0)
  }

  /// Empty one entity store. The sync queue is untouched.
  pub fn clear_cache(&self, store: StoreName) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM entity_cache WHERE store = ?",
        params![store.as_str()],
      )
      .map_err(|e| eyre!("Failed to clear store {}: {}", store, e))
  }

  // ==========================================================================
  // Pending operations
  // ==========================================================================

  /// Append a write to the queue. Returns its id.
  pub fn add_pending_sync(&self, operation: &NewOperation) -> Result<i64> {
    let conn = self.db.conn()?;
    insert_operation(&conn, operation, None)
  }

  /// Unsynced operations still eligible for replay, oldest first.
  pub fn get_pending_operations(&self) -> Result<Vec<PendingOperation>> {
    self.query_operations(
      "WHERE synced = 0 AND status IN ('pending', 'in_flight') ORDER BY id",
      params![],
    )
  }

  /// Operations given up on after a permanent error or too many attempts.
  pub fn failed_operations(&self) -> Result<Vec<PendingOperation>> {
    self.query_operations("WHERE status = 'failed' ORDER BY id", params![])
  }

  pub fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>> {
    Ok(
      self
        .query_operations("WHERE id = ?", params![id])?
        .into_iter()
        .next(),
    )
  }

  pub fn pending_count(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM pending_sync WHERE synced = 0 AND status IN ('pending', 'in_flight')",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count pending operations: {}", e))?;
    Ok(count as usize)
  }

  /// Mark an operation (and the sale it carries) as synced. The first call
  /// stamps `synced_at`; later calls and unknown ids are no-ops.
  pub fn mark_as_synced(&self, id: i64) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let now = format_datetime(Utc::now());
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let updated = tx
      .execute(
        "UPDATE pending_sync
         SET synced = 1, status = 'synced', synced_at = COALESCE(synced_at, ?1),
             last_error = NULL, next_attempt_at = NULL, claim_token = NULL, claimed_at = NULL
         WHERE id = ?2",
        params![now, id],
      )
      .map_err(|e| eyre!("Failed to mark operation {} as synced: {}", id, e))?;

    tx.execute(
      "UPDATE offline_sales
       SET synced = 1, synced_at = COALESCE(synced_at, ?1)
       WHERE id = (SELECT sale_id FROM pending_sync WHERE id = ?2)",
      params![now, id],
    )
    .map_err(|e| eyre!("Failed to mark sale for operation {} as synced: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(updated > 0)
  }

  /// Ids of the operations a sweep starting at `now` should replay, oldest
  /// first: pending ones (past their backoff when `respect_backoff`) and
  /// claims whose lease has run out.
  pub fn due_operations(
    &self,
    kind: Option<OperationKind>,
    now: DateTime<Utc>,
    respect_backoff: bool,
  ) -> Result<Vec<i64>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id FROM pending_sync
         WHERE synced = 0
           AND (?1 IS NULL OR kind = ?1)
           AND ((status = 'pending'
                 AND (?2 = 0 OR next_attempt_at IS NULL OR next_attempt_at <= ?3))
             OR (status = 'in_flight' AND (claimed_at IS NULL OR claimed_at <= ?4)))
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare due query: {}", e))?;

    let ids = stmt
      .query_map(
        params![
          kind.map(|k| k.as_str()),
          respect_backoff,
          format_datetime(now),
          format_datetime(now - self.lease)
        ],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to query due operations: {}", e))?
      .collect::<rusqlite::Result<Vec<i64>>>()
      .map_err(|e| eyre!("Failed to read operation id: {}", e))?;

    Ok(ids)
  }

  /// Claim one operation for sending. Returns `None` when it is synced,
  /// failed, or claimed by another handle whose lease is still running.
  pub fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<Option<PendingOperation>> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let changed = tx
      .execute(
        "UPDATE pending_sync SET status = 'in_flight', claim_token = ?1, claimed_at = ?2
         WHERE id = ?3 AND synced = 0
           AND (status = 'pending'
             OR (status = 'in_flight' AND (claimed_at IS NULL OR claimed_at <= ?4)))",
        params![
          self.token,
          format_datetime(now),
          id,
          format_datetime(now - self.lease)
        ],
      )
      .map_err(|e| eyre!("Failed to claim operation {}: {}", id, e))?;
    if changed == 0 {
      return Ok(None);
    }

    let raw = tx
      .query_row(
        &format!("SELECT {} FROM pending_sync WHERE id = ?", OPERATION_COLUMNS),
        params![id],
        RawOperation::from_row,
      )
      .map_err(|e| eyre!("Failed to read operation {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit claim: {}", e))?;

    raw.into_operation().map(Some)
  }

  /// Record a failed replay of an operation this handle claimed. With
  /// `retry_at` it goes back to the queue, due at that time; without it the
  /// operation becomes `failed`. `counted` adds the try to `attempts`.
  /// Returns false when the claim was no longer ours.
  pub fn record_failure(
    &self,
    id: i64,
    error: &str,
    retry_at: Option<DateTime<Utc>>,
    counted: bool,
  ) -> Result<bool> {
    let conn = self.db.conn()?;
    let status = match retry_at {
      Some(_) => OperationStatus::Pending,
      None => OperationStatus::Failed,
    };
    let increment: i64 = if counted { 1 } else { 0 };

    let changed = conn
      .execute(
        "UPDATE pending_sync
         SET status = ?1, last_error = ?2, next_attempt_at = ?3, attempts = attempts + ?4,
             claim_token = NULL, claimed_at = NULL
         WHERE id = ?5 AND status = 'in_flight' AND claim_token = ?6",
        params![
          status.as_str(),
          error,
          retry_at.map(format_datetime),
          increment,
          id,
          self.token
        ],
      )
      .map_err(|e| eyre!("Failed to record failure for operation {}: {}", id, e))?;

    Ok(changed > 0)
  }

  /// Put an operation this handle claimed back in the queue untouched.
  pub fn release_claim(&self, id: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "UPDATE pending_sync SET status = 'pending', claim_token = NULL, claimed_at = NULL
         WHERE id = ? AND status = 'in_flight' AND claim_token = ?",
        params![id, self.token],
      )
      .map_err(|e| eyre!("Failed to release operation {}: {}", id, e))?;
    Ok(changed > 0)
  }

  /// Give a failed operation another round of attempts.
  pub fn requeue_failed(&self, id: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "UPDATE pending_sync SET status = 'pending', attempts = 0, next_attempt_at = NULL
         WHERE id = ? AND status = 'failed'",
        params![id],
      )
      .map_err(|e| eyre!("Failed to requeue operation {}: {}", id, e))?;
    Ok(changed > 0)
  }

  /// Return claims whose lease ran out before `now` to the queue.
  pub fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE pending_sync SET status = 'pending', claim_token = NULL, claimed_at = NULL
         WHERE status = 'in_flight' AND (claimed_at IS NULL OR claimed_at <= ?)",
        params![format_datetime(now - self.lease)],
      )
      .map_err(|e| eyre!("Failed to release expired claims: {}", e))
  }

  /// Delete synced operations and synced sales. Nothing is removed
  /// automatically; this is the manual cleanup.
  pub fn purge_synced(&self) -> Result<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let operations = tx
      .execute("DELETE FROM pending_sync WHERE status = 'synced'", [])
      .map_err(|e| eyre!("Failed to purge operations: {}", e))?;
    let sales = tx
      .execute("DELETE FROM offline_sales WHERE synced = 1", [])
      .map_err(|e| eyre!("Failed to purge sales: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit purge: {}", e))?;
    info!(operations, sales, "purged synced records");

    Ok(operations)
  }

  // ==========================================================================
  // Offline sales
  // ==========================================================================

  /// Store a sale and queue its POST to `endpoint` in one transaction:
  /// either both are written or neither is.
  pub fn save_offline_sale(&self, sale: &Sale, endpoint: &str) -> Result<i64> {
    let mut conn = self.db.conn()?;
    let data = serde_json::to_vec(sale).map_err(|e| eyre!("Failed to serialize sale: {}", e))?;
    let body = serde_json::to_value(sale).map_err(|e| eyre!("Failed to serialize sale: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO offline_sales (id, data, created_at, synced) VALUES (?, ?, ?, 0)",
      params![sale.id, data, format_datetime(sale.created_at)],
    )
    .map_err(|e| eyre!("Failed to store sale {}: {}", sale.id, e))?;

    let operation = NewOperation::new(OperationKind::Sale, crate::http::Method::Post, endpoint)
      .with_body(body);
    let id = insert_operation(&tx, &operation, Some(&sale.id))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit sale {}: {}", sale.id, e))?;
    info!(sale_id = %sale.id, op_id = id, "sale stored for later sync");

    Ok(id)
  }

  /// Stored sales, oldest first.
  pub fn get_offline_sales(&self, unsynced_only: bool) -> Result<Vec<Sale>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT data, synced, synced_at FROM offline_sales
         WHERE (?1 = 0 OR synced = 0)
         ORDER BY created_at, id",
      )
      .map_err(|e| eyre!("Failed to prepare sales query: {}", e))?;

    let rows = stmt
      .query_map(params![unsynced_only], |row| {
        Ok((
          row.get::<_, Vec<u8>>(0)?,
          row.get::<_, bool>(1)?,
          row.get::<_, Option<String>>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query sales: {}", e))?;

    let mut sales = Vec::new();
    for row in rows {
      let (data, synced, synced_at) = row.map_err(|e| eyre!("Failed to read sale: {}", e))?;
      let mut sale: Sale =
        serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize sale: {}", e))?;
      sale.synced = synced;
      sale.synced_at = synced_at.as_deref().map(parse_datetime).transpose()?;
      sales.push(sale);
    }

    Ok(sales)
  }

  fn query_operations(
    &self,
    clause: &str,
    params: &[&dyn rusqlite::ToSql],
  ) -> Result<Vec<PendingOperation>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM pending_sync {}",
        OPERATION_COLUMNS, clause
      ))
      .map_err(|e| eyre!("Failed to prepare operation query: {}", e))?;

    let rows = stmt
      .query_map(params, RawOperation::from_row)
      .map_err(|e| eyre!("Failed to query operations: {}", e))?;

    let mut operations = Vec::new();
    for raw in rows {
      let raw = raw.map_err(|e| eyre!("Failed to read operation: {}", e))?;
      operations.push(raw.into_operation()?);
    }

    Ok(operations)
  }
}

fn entity_key<T: Cacheable>(store: StoreName, entity: &T) -> Result<String> {
  let key = entity.cache_key();
  if key.is_empty() {
    return Err(eyre!("Cannot store an entity without an id in {}", store));
  }
  Ok(key)
}

fn insert_operation(
  conn: &rusqlite::Connection,
  operation: &NewOperation,
  sale_id: Option<&str>,
) -> Result<i64> {
  let headers = serde_json::to_string(&operation.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
  let body = operation
    .body
    .as_ref()
    .map(serde_json::to_vec)
    .transpose()
    .map_err(|e| eyre!("Failed to serialize body: {}", e))?;

  conn
    .execute(
      "INSERT INTO pending_sync (kind, method, url, headers, body, sale_id, created_at, synced, status, attempts)
       VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'pending', 0)",
      params![
        operation.kind.as_str(),
        operation.method.as_str(),
        operation.url,
        headers,
        body,
        sale_id,
        format_datetime(Utc::now())
      ],
    )
    .map_err(|e| eyre!("Failed to queue operation: {}", e))?;

  let id = conn.last_insert_rowid();
  debug!(op_id = id, kind = operation.kind.as_str(), url = %operation.url, "queued operation");
  Ok(id)
}

/// Row as read from SQLite, before parsing enums, JSON and timestamps.
struct RawOperation {
  id: i64,
  kind: String,
  method: String,
  url: String,
  headers: String,
  body: Option<Vec<u8>>,
  sale_id: Option<String>,
  created_at: String,
  synced: bool,
  synced_at: Option<String>,
  status: String,
  attempts: u32,
  last_error: Option<String>,
  next_attempt_at: Option<String>,
}

impl RawOperation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      kind: row.get(1)?,
      method: row.get(2)?,
      url: row.get(3)?,
      headers: row.get(4)?,
      body: row.get(5)?,
      sale_id: row.get(6)?,
      created_at: row.get(7)?,
      synced: row.get(8)?,
      synced_at: row.get(9)?,
      status: row.get(10)?,
      attempts: row.get(11)?,
      last_error: row.get(12)?,
      next_attempt_at: row.get(13)?,
    })
  }

  fn into_operation(self) -> Result<PendingOperation> {
    Ok(PendingOperation {
      id: self.id,
      kind: self.kind.parse()?,
      method: self.method.parse()?,
      url: self.url,
      headers: serde_json::from_str(&self.headers)
        .map_err(|e| eyre!("Failed to deserialize headers of operation {}: {}", self.id, e))?,
      body: self
        .body
        .as_deref()
        .map(serde_json::from_slice)
        .transpose()
        .map_err(|e| eyre!("Failed to deserialize body of operation {}: {}", self.id, e))?,
      sale_id: self.sale_id,
      created_at: parse_datetime(&self.created_at)?,
      synced: self.synced,
      synced_at: self.synced_at.as_deref().map(parse_datetime).transpose()?,
      status: self.status.parse()?,
      attempts: self.attempts,
      last_error: self.last_error,
      next_attempt_at: self
        .next_attempt_at
        .as_deref()
        .map(parse_datetime)
        .transpose()?,
    })
  }
}
