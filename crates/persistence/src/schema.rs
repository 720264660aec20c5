//! Database schema definitions

/// SQL to create all tables
/// NOTE: Records are stored as JSON text; decimals inside them are serialized as strings
pub const CREATE_TABLES: &str = r#"
-- Research sessions (one row per autopilot session, latest snapshot)
CREATE TABLE IF NOT EXISTS research_sessions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    strategy TEXT NOT NULL,
    record_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Session steps (append-only progress trail)
CREATE TABLE IF NOT EXISTS session_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    UNIQUE(session_id, seq)
);

-- Experiment audit notes (immutable once written)
CREATE TABLE IF NOT EXISTS experiment_notes (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    decision TEXT NOT NULL,
    score TEXT,
    record_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Keyed memory entries (experiment registry, search-space presets)
CREATE TABLE IF NOT EXISTS memory_entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_sessions_status ON research_sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_created ON research_sessions(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_steps_session ON session_steps(session_id, seq);
CREATE INDEX IF NOT EXISTS idx_experiments_session ON experiment_notes(session_id, sequence);
CREATE INDEX IF NOT EXISTS idx_experiments_fingerprint ON experiment_notes(fingerprint)
"#;

/// Additive column migrations, applied after `CREATE_TABLES`.
/// "duplicate column name" errors are tolerated so these can run on every start.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE research_sessions ADD COLUMN finished_at INTEGER",
    "ALTER TABLE research_sessions ADD COLUMN last_error TEXT",
];
