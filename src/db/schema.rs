//! Ordered schema migrations. Entry `n` upgrades `user_version` from `n` to
//! `n + 1`; applied entries are never edited, only appended to.

pub const MIGRATIONS: &[&str] = &[
  // v1: entity snapshots, the write queue, POS sales and response caches
  r#"
CREATE TABLE IF NOT EXISTS entity_cache (
    store TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (store, entity_key)
);

CREATE TABLE IF NOT EXISTS pending_sync (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL DEFAULT '[]',
    body BLOB,
    sale_id TEXT,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_sync_synced ON pending_sync(synced, id);

CREATE TABLE IF NOT EXISTS offline_sales (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT
);

CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, request_key)
);
"#,
  // v2: retry bookkeeping; existing synced rows become terminal
  r#"
ALTER TABLE pending_sync ADD COLUMN status TEXT NOT NULL DEFAULT 'pending';
ALTER TABLE pending_sync ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
ALTER TABLE pending_sync ADD COLUMN last_error TEXT;
ALTER TABLE pending_sync ADD COLUMN next_attempt_at TEXT;

UPDATE pending_sync SET status = 'synced' WHERE synced = 1;

CREATE INDEX IF NOT EXISTS idx_pending_sync_status ON pending_sync(status, id);
"#,
  // v3: claims carry their owner and time so only expired ones are taken over
  r#"
ALTER TABLE pending_sync ADD COLUMN claim_token TEXT;
ALTER TABLE pending_sync ADD COLUMN claimed_at TEXT;

UPDATE pending_sync SET status = 'pending' WHERE status = 'in_flight';
"#,
];

/// Schema version after all migrations have run.
pub fn latest_version() -> i64 {
  MIGRATIONS.len() as i64
}
