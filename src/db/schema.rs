/// Schema for the persistence substrate: one table per logical store.
pub const SCHEMA: &str = r#"
-- Key/value cache with per-entry lifetime (ttl_seconds = 0 never expires)
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    stored_at_ms INTEGER NOT NULL,
    ttl_seconds INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
    ON cache_entries(ttl_seconds, stored_at_ms);

-- Pending writes, ordered by id (AUTOINCREMENT never reuses ids)
CREATE TABLE IF NOT EXISTS mutation_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    op_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    idempotency_key TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    last_attempt_at_ms INTEGER,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_status
    ON mutation_queue(status, id);
"#;
