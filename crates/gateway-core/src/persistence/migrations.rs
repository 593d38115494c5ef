//! Schema migrations for the persisted relational mirror (spec §6): tools,
//! capabilities, edges, trace history, and adaptive configuration, each kept
//! in sync with the in-memory graph by [`super::mirror::PersistenceMirror`].

/// A database migration, applied in ascending `version` order exactly once.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema: tools, capabilities, edges, traces, adaptive config",
    up: MIGRATION_V1_UP,
}];

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS tool_schema (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    deprecated INTEGER NOT NULL DEFAULT 0,
    usage_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT NOT NULL
);

-- The HNSW ANN index itself lives in-process (component A's usearch index);
-- this table is its durable source of truth, rehydrated into the index at
-- startup.
CREATE TABLE IF NOT EXISTS tool_embedding (
    tool_id TEXT PRIMARY KEY REFERENCES tool_schema(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_dependency (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    observed_count INTEGER NOT NULL DEFAULT 1,
    confidence REAL NOT NULL,
    source TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    last_observed TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id)
);

CREATE INDEX IF NOT EXISTS idx_tool_dependency_from ON tool_dependency(from_id);
CREATE INDEX IF NOT EXISTS idx_tool_dependency_to ON tool_dependency(to_id);

CREATE TABLE IF NOT EXISTS capability_schema (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    hierarchy_level INTEGER NOT NULL DEFAULT 0,
    usage_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    last_used TEXT,
    quarantined INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_capability_content_hash ON capability_schema(content_hash);

CREATE TABLE IF NOT EXISTS capability_embedding (
    capability_id TEXT PRIMARY KEY REFERENCES capability_schema(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS capability_dependency (
    capability_id TEXT NOT NULL REFERENCES capability_schema(id) ON DELETE CASCADE,
    member_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (capability_id, member_id)
);

CREATE INDEX IF NOT EXISTS idx_capability_dependency_member ON capability_dependency(member_id);

CREATE TABLE IF NOT EXISTS workflow_execution (
    workflow_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    intent_text TEXT NOT NULL,
    intent_embedding BLOB NOT NULL,
    context_tool_ids TEXT NOT NULL DEFAULT '[]',
    candidate_id TEXT NOT NULL,
    success INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    error_kind TEXT,
    PRIMARY KEY (workflow_id, step_index)
);

CREATE INDEX IF NOT EXISTS idx_workflow_execution_candidate ON workflow_execution(candidate_id);
CREATE INDEX IF NOT EXISTS idx_workflow_execution_timestamp ON workflow_execution(timestamp);

-- Aggregated recurring tool sequences, maintained by the graph sync
-- controller as candidate capability suggestions (spec §4.H).
CREATE TABLE IF NOT EXISTS workflow_pattern (
    id TEXT PRIMARY KEY,
    tool_sequence TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    success_rate REAL NOT NULL DEFAULT 0.5,
    last_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS adaptive_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .or(Ok(0))
}

pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!("applying migration v{}: {}", migration.version, migration.description);
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }
    Ok(applied)
}
