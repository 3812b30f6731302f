//! Warn-and-above events mirrored into a small SQLite table.
//!
//! Events inherit `connection_id` / `user_id` from the nearest enclosing span
//! that carries them, so a socket's failures can be pulled up by connection.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    at            TEXT NOT NULL,
    level         TEXT NOT NULL,
    target        TEXT NOT NULL,
    message       TEXT NOT NULL,
    extra         TEXT,
    connection_id TEXT,
    user_id       TEXT
);
CREATE INDEX IF NOT EXISTS events_by_connection ON events(connection_id, seq);
CREATE INDEX IF NOT EXISTS events_by_level ON events(level, seq);
";

const DEFAULT_LIMIT: u32 = 100;

/// One persisted event, newest first when returned from [`LogStore::search`].
#[derive(Clone, Debug, Serialize)]
pub struct StoredEvent {
    pub seq: i64,
    pub at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub extra: Option<String>,
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub level: Option<Level>,
    /// Substring match on the event target.
    pub target: Option<String>,
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogFilter {
    fn clauses(&self) -> (String, Vec<String>) {
        let mut conds = Vec::new();
        let mut args = Vec::new();
        let mut push = |cond: &str, arg: String| {
            args.push(arg);
            conds.push(format!("{cond} ?{}", args.len()));
        };
        if let Some(level) = self.level {
            push("level =", level.as_str().to_owned());
        }
        if let Some(target) = &self.target {
            push("target LIKE", format!("%{target}%"));
        }
        if let Some(id) = &self.connection_id {
            push("connection_id =", id.clone());
        }
        if let Some(id) = &self.user_id {
            push("user_id =", id.clone());
        }
        if let Some(since) = &self.since {
            push("at >=", since.clone());
        }
        let filter = if conds.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conds.join(" AND "))
        };
        (filter, args)
    }
}

/// SQLite table of persisted events.
pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, event: &PendingEvent) -> rusqlite::Result<()> {
        self.conn.lock().execute(
            "INSERT INTO events (at, level, target, message, extra, connection_id, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                event.at,
                event.level.as_str(),
                event.target,
                event.message,
                event.extra,
                event.ids.connection_id,
                event.ids.user_id,
            ],
        )?;
        Ok(())
    }

    pub fn search(&self, filter: &LogFilter) -> rusqlite::Result<Vec<StoredEvent>> {
        let (clause, args) = filter.clauses();
        let sql = format!(
            "SELECT seq, at, level, target, message, extra, connection_id, user_id
             FROM events{clause} ORDER BY seq DESC LIMIT {}",
            filter.limit.unwrap_or(DEFAULT_LIMIT)
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(StoredEvent {
                    seq: row.get("seq")?,
                    at: row.get("at")?,
                    level: row.get("level")?,
                    target: row.get("target")?,
                    message: row.get("message")?,
                    extra: row.get("extra")?,
                    connection_id: row.get("connection_id")?,
                    user_id: row.get("user_id")?,
                })
            })?
            .collect();
        events
    }

    pub fn len(&self) -> rusqlite::Result<i64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
    }
}

/// Identifiers that tie an event to a socket or a user.
#[derive(Clone, Debug, Default)]
struct Correlation {
    connection_id: Option<String>,
    user_id: Option<String>,
}

impl Correlation {
    fn is_complete(&self) -> bool {
        self.connection_id.is_some() && self.user_id.is_some()
    }

    fn inherit(&mut self, outer: &Correlation) {
        if self.connection_id.is_none() {
            self.connection_id.clone_from(&outer.connection_id);
        }
        if self.user_id.is_none() {
            self.user_id.clone_from(&outer.user_id);
        }
    }

    fn overwrite_from(&mut self, newer: Correlation) {
        if newer.connection_id.is_some() {
            self.connection_id = newer.connection_id;
        }
        if newer.user_id.is_some() {
            self.user_id = newer.user_id;
        }
    }
}

struct PendingEvent {
    at: String,
    level: Level,
    target: String,
    message: String,
    extra: Option<String>,
    ids: Correlation,
}

#[derive(Default)]
struct Collected {
    values: BTreeMap<&'static str, Value>,
}

impl Collected {
    fn take_text(&mut self, key: &str) -> Option<String> {
        match self.values.remove(key)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    fn split_ids(&mut self) -> Correlation {
        Correlation {
            connection_id: self.take_text("connection_id"),
            user_id: self.take_text("user_id"),
        }
    }
}

impl Visit for Collected {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            "message" => text,
            _ => text.trim_matches('"').to_owned(),
        };
        self.values.insert(field.name(), Value::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.values.insert(field.name(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.values.insert(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.values.insert(field.name(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.values.insert(field.name(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.values.insert(field.name(), Value::from(value));
    }
}

/// Layer feeding warn-and-above events into a [`LogStore`].
pub struct PersistLayer {
    store: Arc<LogStore>,
    threshold: Level,
}

impl PersistLayer {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self {
            store,
            threshold: Level::WARN,
        }
    }
}

impl<S> Layer<S> for PersistLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        attrs.record(&mut collected);
        let ids = collected.split_ids();
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(ids);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        values.record(&mut collected);
        let newer = collected.split_ids();
        if let Some(span) = ctx.span(id) {
            if let Some(ids) = span.extensions_mut().get_mut::<Correlation>() {
                ids.overwrite_from(newer);
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.threshold {
            return;
        }

        let mut collected = Collected::default();
        event.record(&mut collected);
        let mut ids = collected.split_ids();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if ids.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    ids.inherit(outer);
                }
            }
        }

        let message = collected.take_text("message").unwrap_or_default();
        let extra = (!collected.values.is_empty())
            .then(|| serde_json::to_string(&collected.values).ok())
            .flatten();

        let pending = PendingEvent {
            at: chrono::Utc::now().to_rfc3339(),
            level: *meta.level(),
            target: meta.target().to_owned(),
            message,
            extra,
            ids,
        };
        if let Err(err) = self.store.append(&pending) {
            eprintln!("parley-telemetry: dropping event: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn seed(store: &LogStore, at: &str, level: Level, message: &str, connection: Option<&str>) {
        store
            .append(&PendingEvent {
                at: at.into(),
                level,
                target: "parley_server::connection".into(),
                message: message.into(),
                extra: None,
                ids: Correlation {
                    connection_id: connection.map(str::to_owned),
                    user_id: None,
                },
            })
            .unwrap();
    }

    #[test]
    fn filters_combine_with_and() {
        let store = LogStore::in_memory().unwrap();
        seed(&store, "2026-03-01T10:00:00Z", Level::WARN, "slow upstream", Some("c1"));
        seed(&store, "2026-03-01T10:00:01Z", Level::ERROR, "upstream died", Some("c1"));
        seed(&store, "2026-03-01T10:00:02Z", Level::ERROR, "bad frame", Some("c2"));

        let hits = store
            .search(&LogFilter {
                level: Some(Level::ERROR),
                connection_id: Some("c1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message, "upstream died");

        let by_target = store
            .search(&LogFilter {
                target: Some("connection".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_target.len(), 3);
    }

    #[test]
    fn newest_first_with_limit_and_lower_bound() {
        let store = LogStore::in_memory().unwrap();
        for n in 0..6 {
            seed(&store, &format!("2026-03-01T10:00:0{n}Z"), Level::WARN, &format!("e{n}"), None);
        }

        let top = store
            .search(&LogFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        let messages: Vec<_> = top.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["e5", "e4"]);

        let late = store
            .search(&LogFilter {
                since: Some("2026-03-01T10:00:04Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(late.len(), 2);
        assert_eq!(store.len().unwrap(), 6);
    }

    #[test]
    fn layer_keeps_warnings_and_tags_them_from_spans() {
        let store = Arc::new(LogStore::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(PersistLayer::new(store.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let conn = tracing::info_span!(
                "connection",
                connection_id = "c9",
                user_id = tracing::field::Empty
            );
            let _outer = conn.enter();
            tracing::info!("not kept");
            conn.record("user_id", "u3");
            let request = tracing::info_span!("request");
            let _inner = request.enter();
            tracing::warn!(attempt = 2u64, "upstream slow");
        });

        let kept = store.search(&LogFilter::default()).unwrap();
        assert_eq!(kept.len(), 1);
        let event = &kept[0];
        assert_eq!(event.message, "upstream slow");
        assert_eq!(event.level, "WARN");
        assert_eq!(event.connection_id.as_deref(), Some("c9"));
        assert_eq!(event.user_id.as_deref(), Some("u3"));
        assert_eq!(event.extra.as_deref(), Some(r#"{"attempt":2}"#));
    }

    #[test]
    fn event_fields_override_span_ids() {
        let store = Arc::new(LogStore::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(PersistLayer::new(store.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let _g = tracing::info_span!("connection", connection_id = "outer").entered();
            tracing::error!(connection_id = "inner", "boom");
        });

        let kept = store.search(&LogFilter::default()).unwrap();
        assert_eq!(kept[0].connection_id.as_deref(), Some("inner"));
        assert_eq!(kept[0].extra, None);
    }
}
