/// Schema for durable sync state.
///
/// Each row is one named JSON blob (the live queue, the failure list).
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_blobs (
    storage_key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
