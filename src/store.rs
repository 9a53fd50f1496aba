//! Append-only persistence of activity events.
//!
//! The production backend is SQLite behind an `r2d2` pool. Every insert
//! checks out its own connection for the duration of one statement, so
//! concurrent intake workers never share a session.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2_sqlite::rusqlite::types::Type;
use r2d2_sqlite::rusqlite::{self, params, Connection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;

use crate::classifier::FieldMap;

/// Surrogate key assigned by the store on insert.
pub type EventId = i64;

/// Column limit carried over for `action`, `ip_address` and `user_agent`.
pub const MAX_COLUMN_CHARS: usize = 255;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS activity_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL CHECK (length(action) <= 255),
    data TEXT NOT NULL DEFAULT '{}',
    ip_address TEXT NULL,
    user_agent TEXT NULL,
    timestamp TEXT NOT NULL
);";

const INSERT_EVENT: &str = "INSERT INTO activity_logs
    (action, data, ip_address, user_agent, timestamp)
    VALUES (?1, ?2, ?3, ?4, ?5)";

const SELECT_RECENT: &str = "SELECT id, action, data, ip_address, user_agent, timestamp
    FROM activity_logs ORDER BY id DESC LIMIT ?1";

/// Failure to durably record an event.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding event data: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store worker: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An event built by the recorder, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivityEvent {
    pub action: String,
    pub data: FieldMap,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NewActivityEvent {
    /// Stamp a new event with the current time.
    pub fn new(
        action: impl Into<String>,
        data: FieldMap,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            action: action.into(),
            data,
            ip_address,
            user_agent,
            timestamp: Utc::now(),
        }
    }
}

/// A persisted event. There is no update path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: EventId,
    pub action: String,
    pub data: FieldMap,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    fn from_new(id: EventId, event: NewActivityEvent) -> Self {
        Self {
            id,
            action: event.action,
            data: event.data,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            timestamp: event.timestamp,
        }
    }
}

#[async_trait::async_trait]
pub trait ActivityStore: Send + Sync {
    /// Durably append one event and return its id.
    async fn insert(&self, event: NewActivityEvent) -> Result<EventId, StoreError>;

    /// Newest events first, at most `limit`.
    async fn recent(&self, limit: usize) -> Result<Vec<ActivityEvent>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and make sure the
    /// `activity_logs` table exists.
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(init_connection);
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)?;
        pool.get()?.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.as_ref().display(), pool_size, "activity store ready");
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl ActivityStore for SqliteStore {
    async fn insert(&self, event: NewActivityEvent) -> Result<EventId, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<EventId, StoreError> {
            let conn = pool.get()?;
            insert_event(&conn, &event)
        })
        .await?
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ActivityEvent>, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ActivityEvent>, StoreError> {
            let conn = pool.get()?;
            select_recent(&conn, limit)
        })
        .await?
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = pool.get()?;
            let sql = "SELECT COUNT(*) FROM activity_logs";
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
        .await?
    }
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
}

fn insert_event(conn: &Connection, event: &NewActivityEvent) -> Result<EventId, StoreError> {
    let data = serde_json::to_string(&event.data)?;
    conn.execute(
        INSERT_EVENT,
        params![
            event.action,
            data,
            event.ip_address.as_deref().map(truncate_column),
            event.user_agent.as_deref().map(truncate_column),
            event.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn select_recent(conn: &Connection, limit: usize) -> Result<Vec<ActivityEvent>, StoreError> {
    let mut stmt = conn.prepare(SELECT_RECENT)?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![limit], parse_event_row)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityEvent> {
    let raw_data: String = row.get(2)?;
    let data = serde_json::from_str::<FieldMap>(&raw_data)
        .map_err(|err| conversion_error(2, err))?;
    let raw_ts: String = row.get(5)?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
        .map_err(|err| conversion_error(5, err))?
        .with_timezone(&Utc);
    Ok(ActivityEvent {
        id: row.get(0)?,
        action: row.get(1)?,
        data,
        ip_address: row.get(3)?,
        user_agent: row.get(4)?,
        timestamp,
    })
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn truncate_column(value: &str) -> String {
    value.chars().take(MAX_COLUMN_CHARS).collect()
}

/// In-process store for tests and dry runs. Ids start at 1.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<ActivityEvent>>,
    refuse_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every insert fails with [`StoreError::Unavailable`].
    pub fn set_refuse_writes(&self, refuse: bool) {
        self.refuse_writes.store(refuse, Ordering::SeqCst);
    }

    /// Snapshot of stored events in insertion order.
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ActivityStore for MemoryStore {
    async fn insert(&self, mut event: NewActivityEvent) -> Result<EventId, StoreError> {
        if self.refuse_writes.load(Ordering::SeqCst) {
            let reason = "memory store refusing writes".to_string();
            return Err(StoreError::Unavailable(reason));
        }
        if event.action.chars().count() > MAX_COLUMN_CHARS {
            let reason = "action exceeds column limit".to_string();
            return Err(StoreError::Unavailable(reason));
        }
        event.ip_address = event.ip_address.as_deref().map(truncate_column);
        event.user_agent = event.user_agent.as_deref().map(truncate_column);
        let mut guard = self
            .events
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        let id = guard.len() as EventId + 1;
        guard.push(ActivityEvent::from_new(id, event));
        Ok(id)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ActivityEvent>, StoreError> {
        Ok(self.events().into_iter().rev().take(limit).collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.events().len() as u64)
    }
}
