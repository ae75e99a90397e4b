/// SQL DDL for the execution store.
/// WAL mode + busy timeout applied at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    tool TEXT NOT NULL,
    transaction_id TEXT NOT NULL,
    native_session_id TEXT,
    resumed_from TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'completed', 'failed', 'killed')),
    working_directory TEXT NOT NULL,
    exit_code INTEGER,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_transaction
    ON executions(transaction_id);

-- One live owner per native session. Failed/killed records drop out of the
-- index so a later launch may claim the id again.
CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_native_live
    ON executions(native_session_id)
    WHERE native_session_id IS NOT NULL AND status IN ('pending', 'completed');

-- One live launch continuing a given native session at a time.
CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_resume_live
    ON executions(resumed_from)
    WHERE resumed_from IS NOT NULL AND status = 'pending';

CREATE INDEX IF NOT EXISTS idx_executions_conversation
    ON executions(conversation_id, started_at);
CREATE INDEX IF NOT EXISTS idx_executions_tool ON executions(tool);
CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA busy_timeout = 5000;
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;
