//! SQLite persistence for warn+ events.
//!
//! Rows carry the `group` and `connection_id` fields when an event (or one of
//! its enclosing spans) recorded them, so a reconnect storm can be traced by
//! channel after the fact.
//!
//! Events with a `system_event` field (`connect`, `disconnect`) are kept at
//! any level and expire after [`SYSTEM_EVENT_RETENTION`].

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// How long system events are kept.
pub const SYSTEM_EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    /// Row id.
    pub id: i64,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// `WARN` or `ERROR`, or any level for system events.
    pub level: String,
    /// Event target (module path).
    pub target: String,
    /// Rendered message.
    pub message: String,
    /// Remaining structured fields as a JSON object.
    pub fields: Option<String>,
    /// Channel the event concerned, if any.
    pub group: Option<String>,
    /// Transport connection id, if any.
    pub connection_id: Option<String>,
    /// System event kind (`connect`, `disconnect`), if any.
    pub system_event: Option<String>,
}

/// Filters for [`SqliteLogSink::query`].
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Exact level match.
    pub level: Option<String>,
    /// Substring match on target.
    pub target: Option<String>,
    /// Exact group match.
    pub group: Option<String>,
    /// Exact system event kind.
    pub system_event: Option<String>,
    /// Lower bound on timestamp (RFC 3339).
    pub since: Option<String>,
    /// Maximum rows, newest first. Defaults to 100.
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    /// Open (or create) the log database at `db_path`.
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 grp TEXT,
                 connection_id TEXT,
                 system_event TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_group ON logs(grp);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        // Databases created before system events were recorded.
        let has_system_event = conn
            .prepare("SELECT 1 FROM pragma_table_info('logs') WHERE name = 'system_event'")?
            .exists([])?;
        if !has_system_event {
            conn.execute_batch("ALTER TABLE logs ADD COLUMN system_event TEXT")?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        {
            let conn = self.conn.lock();
            let _ = conn.execute(
                "INSERT INTO logs (timestamp, level, target, message, fields, grp, connection_id, system_event)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.timestamp,
                    record.level,
                    record.target,
                    record.message,
                    record.fields,
                    record.group,
                    record.connection_id,
                    record.system_event,
                ],
            );
        }
        if record.system_event.is_some() {
            let _ = self.prune_system_events(SYSTEM_EVENT_RETENTION);
        }
    }

    /// Delete system events older than `retention`. Returns how many went.
    pub fn prune_system_events(&self, retention: Duration) -> Result<usize, rusqlite::Error> {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM logs WHERE system_event IS NOT NULL AND timestamp < ?1",
            [cutoff.to_rfc3339()],
        )
    }

    /// Query persisted rows, newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, grp, connection_id, system_event \
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            let _ = write!(sql, " AND level = ?{}", params.len() + 1);
            params.push(Box::new(level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            let _ = write!(sql, " AND target LIKE ?{}", params.len() + 1);
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(group) = &q.group {
            let _ = write!(sql, " AND grp = ?{}", params.len() + 1);
            params.push(Box::new(group.clone()));
        }
        if let Some(kind) = &q.system_event {
            let _ = write!(sql, " AND system_event = ?{}", params.len() + 1);
            params.push(Box::new(kind.clone()));
        }
        if let Some(since) = &q.since {
            let _ = write!(sql, " AND timestamp >= ?{}", params.len() + 1);
            params.push(Box::new(since.clone()));
        }

        let _ = write!(sql, " ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(AsRef::as_ref).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                group: row.get(6)?,
                connection_id: row.get(7)?,
                system_event: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    /// Total persisted rows.
    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    group: Option<String>,
    connection_id: Option<String>,
    system_event: Option<String>,
}

/// `tracing` layer that writes warn+ events and system events to a
/// [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    /// Wrap a sink.
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
    group: Option<String>,
    connection_id: Option<String>,
    system_event: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "group" => self.group = Some(value),
            "connection_id" => self.connection_id = Some(value),
            "system_event" => self.system_event = Some(value),
            other => {
                let _ = self.fields.insert(other.to_string(), Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        self.put(field.name(), rendered.trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        let _ = self
            .fields
            .insert(field.name().to_string(), Value::Bool(value));
    }
}

/// Stored on spans so child events inherit `group` / `connection_id`.
struct SpanFields {
    group: Option<String>,
    connection_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.group.is_none() && visitor.connection_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields {
                group: visitor.group,
                connection_id: visitor.connection_id,
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        let is_system = event.metadata().fields().field("system_event").is_some();
        if level > tracing::Level::WARN && !is_system {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if visitor.group.is_some() && visitor.connection_id.is_some() {
                    break;
                }
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<SpanFields>() {
                    if visitor.group.is_none() {
                        visitor.group.clone_from(&fields.group);
                    }
                    if visitor.connection_id.is_none() {
                        visitor.connection_id.clone_from(&fields.connection_id);
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            group: visitor.group,
            connection_id: visitor.connection_id,
            system_event: visitor.system_event,
        });
    }
}
