/// Schema for the runtime's durable state.
pub const SCHEMA: &str = r#"
-- One row per cache generation (namespace)
CREATE TABLE IF NOT EXISTS cache_versions (
    version TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Cached responses, keyed by version + request key hash
CREATE TABLE IF NOT EXISTS cache_entries (
    version TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    vary TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (version, key_hash)
);

-- Mutations waiting to be replayed
CREATE TABLE IF NOT EXISTS sync_tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    status TEXT NOT NULL,
    last_error TEXT,
    -- Set while a drain owns the task; stale claims are recovered
    claimed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_status
    ON sync_tasks(status, created_at, seq);

-- Notification tags that were already shown
CREATE TABLE IF NOT EXISTS displayed_notifications (
    tag TEXT PRIMARY KEY,
    displayed_at TEXT NOT NULL
);
"#;
