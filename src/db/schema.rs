/// Schema for the mutation outbox.
pub const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    operation TEXT NOT NULL,
    target_collection TEXT NOT NULL,
    target_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER,
    claimed_at INTEGER,
    completed_at INTEGER,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutations_status ON mutations(status);

CREATE INDEX IF NOT EXISTS idx_mutations_target
    ON mutations(target_collection, target_id, id);
"#;

/// Schema for the read-through response cache.
pub const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    fetched_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_name ON response_cache(cache_name);
"#;
