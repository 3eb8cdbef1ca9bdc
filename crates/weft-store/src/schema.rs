/// SQL DDL for the weft database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    agent TEXT NOT NULL,
    session_id TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent, session_id)
);

CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    orchestration TEXT NOT NULL,
    input TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    output TEXT,
    error TEXT,
    custom_status TEXT,
    parent_instance_id TEXT,
    parent_sequence_no INTEGER,
    resolution_counter INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS history (
    instance_id TEXT NOT NULL REFERENCES instances(id),
    sequence_no INTEGER NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    target TEXT,
    input TEXT,
    status TEXT NOT NULL DEFAULT 'scheduled',
    result TEXT,
    error TEXT,
    resolved_order INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (instance_id, sequence_no)
);

CREATE TABLE IF NOT EXISTS event_buffer (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    event_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
CREATE INDEX IF NOT EXISTS idx_instances_parent ON instances(parent_instance_id);
CREATE INDEX IF NOT EXISTS idx_history_instance ON history(instance_id);
CREATE INDEX IF NOT EXISTS idx_history_unresolved ON history(instance_id, status, kind);
CREATE INDEX IF NOT EXISTS idx_event_buffer_target ON event_buffer(instance_id, event_name);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
