//! Persisted launch diagnostics.
//!
//! [`SqliteLogLayer`] keeps WARN and ERROR events in a small SQLite table,
//! keyed by the launch they belong to. The launch keys come from the event's
//! own fields or, failing that, from the nearest enclosing span that carries
//! them (the executor's `launch` span).

use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS launch_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    logged_at TEXT NOT NULL,
    severity INTEGER NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    execution_id TEXT,
    conversation_id TEXT,
    transaction_id TEXT,
    tool TEXT,
    native_session_id TEXT,
    fields TEXT
);
CREATE INDEX IF NOT EXISTS idx_launch_logs_execution ON launch_logs(execution_id);
CREATE INDEX IF NOT EXISTS idx_launch_logs_conversation ON launch_logs(conversation_id);
CREATE INDEX IF NOT EXISTS idx_launch_logs_transaction ON launch_logs(transaction_id);
CREATE INDEX IF NOT EXISTS idx_launch_logs_tool ON launch_logs(tool, severity);
";

/// Identifiers tying a log line to one launch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchKeys {
    pub execution_id: Option<String>,
    pub conversation_id: Option<String>,
    pub transaction_id: Option<String>,
    pub tool: Option<String>,
    pub native_session_id: Option<String>,
}

impl LaunchKeys {
    /// Store `value` if `name` is a launch key. Returns whether it was one.
    fn set(&mut self, name: &str, value: &str) -> bool {
        let slot = match name {
            "execution_id" => &mut self.execution_id,
            "conversation_id" => &mut self.conversation_id,
            "transaction_id" => &mut self.transaction_id,
            "tool" => &mut self.tool,
            "native_session_id" => &mut self.native_session_id,
            _ => return false,
        };
        *slot = Some(value.trim_matches('"').to_string());
        true
    }

    /// Fill keys still missing here from `outer`.
    fn inherit(&mut self, outer: &LaunchKeys) {
        for (mine, theirs) in [
            (&mut self.execution_id, &outer.execution_id),
            (&mut self.conversation_id, &outer.conversation_id),
            (&mut self.transaction_id, &outer.transaction_id),
            (&mut self.tool, &outer.tool),
            (&mut self.native_session_id, &outer.native_session_id),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One persisted event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub keys: LaunchKeys,
    /// Remaining event fields as a JSON object.
    pub fields: Option<serde_json::Value>,
}

/// Filter for [`SqliteLogSink::query`]. Newest entries come first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Lowest severity to include.
    pub min_level: Option<Level>,
    pub execution_id: Option<String>,
    pub conversation_id: Option<String>,
    pub transaction_id: Option<String>,
    pub tool: Option<String>,
    /// RFC 3339 lower bound.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )?;
        Self::with_schema(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, level: Level, target: &str, message: &str, keys: &LaunchKeys, fields: Option<String>) {
        let conn = self.conn.lock();
        // A lost diagnostic must never take the launch down with it.
        let _ = conn.execute(
            "INSERT INTO launch_logs (logged_at, severity, level, target, message, execution_id,
                                      conversation_id, transaction_id, tool, native_session_id, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                severity(level),
                level.as_str(),
                target,
                message,
                keys.execution_id,
                keys.conversation_id,
                keys.transaction_id,
                keys.tool,
                keys.native_session_id,
                fields,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogEntry>, rusqlite::Error> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(level) = q.min_level {
            params.push(severity(level).into());
            clauses.push(format!("severity >= ?{}", params.len()));
        }
        for (column, value) in [
            ("execution_id", &q.execution_id),
            ("conversation_id", &q.conversation_id),
            ("transaction_id", &q.transaction_id),
            ("tool", &q.tool),
        ] {
            if let Some(v) = value {
                params.push(v.clone().into());
                clauses.push(format!("{column} = ?{}", params.len()));
            }
        }
        if let Some(since) = &q.since {
            params.push(since.clone().into());
            clauses.push(format!("logged_at >= ?{}", params.len()));
        }
        params.push(i64::from(q.limit.unwrap_or(100)).into());

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, logged_at, level, target, message, execution_id, conversation_id,
                    transaction_id, tool, native_session_id, fields
             FROM launch_logs {filter} ORDER BY id DESC LIMIT ?{}",
            params.len()
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            let fields: Option<String> = row.get(10)?;
            Ok(LogEntry {
                id: row.get(0)?,
                logged_at: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                keys: LaunchKeys {
                    execution_id: row.get(5)?,
                    conversation_id: row.get(6)?,
                    transaction_id: row.get(7)?,
                    tool: row.get(8)?,
                    native_session_id: row.get(9)?,
                },
                fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<u64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM launch_logs", [], |row| row.get(0))
    }
}

fn severity(level: Level) -> i64 {
    match level {
        Level::TRACE => 0,
        Level::DEBUG => 1,
        Level::INFO => 2,
        Level::WARN => 3,
        Level::ERROR => 4,
    }
}

/// Writes events at or above `threshold` (WARN by default) to the sink.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
    threshold: Level,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self {
            sink,
            threshold: Level::WARN,
        }
    }

    pub fn with_threshold(mut self, threshold: Level) -> Self {
        self.threshold = threshold;
        self
    }
}

#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    keys: LaunchKeys,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl EventVisitor {
    fn text(&mut self, name: &str, value: &str) {
        if name == "message" {
            self.message = Some(value.to_string());
        } else if !self.keys.set(name, value) {
            let _ = self.extra.insert(name.to_string(), value.into());
        }
    }
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.text(field.name(), &format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        let _ = self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let _ = self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        let _ = self.extra.insert(field.name().to_string(), value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        attrs.record(&mut visitor);
        if visitor.keys.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.keys);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.threshold {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<LaunchKeys>() {
                    visitor.keys.inherit(outer);
                }
            }
        }

        let fields = (!visitor.extra.is_empty())
            .then(|| serde_json::Value::Object(visitor.extra).to_string());
        self.sink.insert(
            level,
            event.metadata().target(),
            visitor.message.as_deref().unwrap_or_default(),
            &visitor.keys,
            fields,
        );
    }
}
