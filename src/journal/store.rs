//! Journal stores: durable SQLite (sqlx) and in-memory for tests/recovery
//! drills.
//!
//! Both stores assign sequence numbers under an internal writer lock so the
//! broadcast subscription observes events in exactly the order they were
//! appended.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::broadcast;

use super::{Event, EventBody, SYSTEM_SESSION_ID};

/// Capacity of the live-event broadcast channel. Lagged subscribers get
/// `RecvError::Lagged` and must resynchronize via replay.
const BROADCAST_CAPACITY: usize = 1024;

/// Journal operation errors.
#[derive(Debug, Error)]
pub enum JournalError {
    /// SQLite database error.
    #[error("database error: {0}")]
    Database(String),
    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for JournalError {
    fn from(e: sqlx::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Serialization(e.to_string())
    }
}

/// Append-only event store with live subscription.
///
/// `emit` assigns the next journal-wide sequence number; `read_session`
/// returns a session's events with `seq >= offset_seq` in ascending order.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append an event, assign its sequence number, notify subscribers.
    async fn emit(&self, session_id: &str, body: EventBody) -> Result<Event, JournalError>;

    /// Read up to `limit` events of a session starting at `offset_seq`
    /// (inclusive), ascending by seq.
    async fn read_session(
        &self,
        session_id: &str,
        offset_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>, JournalError>;

    /// Total number of events recorded for a session.
    async fn count_session(&self, session_id: &str) -> Result<u64, JournalError>;

    /// Read the entire journal in seq order (session recovery scans).
    async fn read_all(&self) -> Result<Vec<Event>, JournalError>;

    /// Drop events of sessions not listed in `retain_sessions`.
    ///
    /// `_system` events are always retained. Returns the number of events
    /// removed.
    async fn compact(&self, retain_sessions: &[String]) -> Result<u64, JournalError>;

    /// Subscribe to live events.
    fn subscribe(&self) -> broadcast::Receiver<Event>;

    /// Flush and release resources. Emits after close are errors.
    async fn close(&self) -> Result<(), JournalError>;
}

// ── In-memory store ─────────────────────────────────────────────

struct MemoryInner {
    events: Vec<Event>,
    next_seq: u64,
    closed: bool,
}

/// In-memory journal used by tests and crash-recovery drills.
///
/// Cheap to clone the contents out of; shares the same ordering contract as
/// the SQLite store.
pub struct MemoryJournal {
    inner: std::sync::Mutex<MemoryInner>,
    tx: broadcast::Sender<Event>,
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJournal {
    /// Create an empty in-memory journal.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: std::sync::Mutex::new(MemoryInner {
                events: Vec::new(),
                next_seq: 1,
                closed: false,
            }),
            tx,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, JournalError> {
        self.inner
            .lock()
            .map_err(|e| JournalError::Database(format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn emit(&self, session_id: &str, body: EventBody) -> Result<Event, JournalError> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(JournalError::Database("journal closed".to_owned()));
        }
        let event = Event {
            seq: inner.next_seq,
            event_type: body.event_type().to_owned(),
            session_id: session_id.to_owned(),
            timestamp: Utc::now(),
            payload: body.payload_json(),
        };
        inner.next_seq = inner.next_seq.saturating_add(1);
        inner.events.push(event.clone());
        // Notify under the lock so subscribers observe append order; a
        // send with no subscribers is not an error.
        let _ = self.tx.send(event.clone());
        drop(inner);
        Ok(event)
    }

    async fn read_session(
        &self,
        session_id: &str,
        offset_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>, JournalError> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.session_id == session_id && e.seq >= offset_seq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_session(&self, session_id: &str) -> Result<u64, JournalError> {
        let inner = self.lock()?;
        let count = inner
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn read_all(&self) -> Result<Vec<Event>, JournalError> {
        let inner = self.lock()?;
        Ok(inner.events.clone())
    }

    async fn compact(&self, retain_sessions: &[String]) -> Result<u64, JournalError> {
        let mut inner = self.lock()?;
        let before = inner.events.len();
        inner.events.retain(|e| {
            e.session_id == SYSTEM_SESSION_ID
                || retain_sessions.iter().any(|s| *s == e.session_id)
        });
        let removed = before.saturating_sub(inner.events.len());
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    async fn close(&self) -> Result<(), JournalError> {
        let mut inner = self.lock()?;
        inner.closed = true;
        Ok(())
    }
}

// ── SQLite store ────────────────────────────────────────────────

const CREATE_EVENTS: &str = "CREATE TABLE IF NOT EXISTS events (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    timestamp  TEXT NOT NULL,
    payload    TEXT NOT NULL
)";

const CREATE_SESSION_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, seq)";

/// SQLite-backed journal using an sqlx pool.
///
/// A single writer connection keeps AUTOINCREMENT seq assignment and the
/// broadcast notification order consistent; the emit path additionally
/// holds an async mutex so two emits cannot interleave insert and notify.
pub struct SqliteJournal {
    pool: SqlitePool,
    tx: broadcast::Sender<Event>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SqliteJournal {
    /// Open (or create) a journal database at `path`.
    pub async fn open(path: &std::path::Path) -> Result<Self, JournalError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        sqlx::query(CREATE_EVENTS).execute(&pool).await?;
        sqlx::query(CREATE_SESSION_INDEX).execute(&pool).await?;
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            pool,
            tx,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, JournalError> {
        let seq: i64 = row.try_get("seq")?;
        let session_id: String = row.try_get("session_id")?;
        let event_type: String = row.try_get("event_type")?;
        let timestamp: String = row.try_get("timestamp")?;
        let payload: String = row.try_get("payload")?;
        Ok(Event {
            seq: u64::try_from(seq).unwrap_or(0),
            event_type,
            session_id,
            timestamp: parse_rfc3339_or_now(&timestamp),
            payload: serde_json::from_str(&payload)?,
        })
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn emit(&self, session_id: &str, body: EventBody) -> Result<Event, JournalError> {
        let _guard = self.write_lock.lock().await;
        if self.pool.is_closed() {
            return Err(JournalError::Database("journal closed".to_owned()));
        }
        let timestamp = Utc::now();
        let payload = body.payload_json();
        let payload_str = serde_json::to_string(&payload)?;
        let result = sqlx::query(
            "INSERT INTO events (session_id, event_type, timestamp, payload)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session_id)
        .bind(body.event_type())
        .bind(timestamp.to_rfc3339())
        .bind(&payload_str)
        .execute(&self.pool)
        .await?;

        let event = Event {
            seq: u64::try_from(result.last_insert_rowid()).unwrap_or(0),
            event_type: body.event_type().to_owned(),
            session_id: session_id.to_owned(),
            timestamp,
            payload,
        };
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    async fn read_session(
        &self,
        session_id: &str,
        offset_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>, JournalError> {
        let offset = i64::try_from(offset_seq).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT seq, session_id, event_type, timestamp, payload FROM events
             WHERE session_id = ?1 AND seq >= ?2 ORDER BY seq ASC LIMIT ?3",
        )
        .bind(session_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn count_session(&self, session_id: &str) -> Result<u64, JournalError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn read_all(&self) -> Result<Vec<Event>, JournalError> {
        let rows = sqlx::query(
            "SELECT seq, session_id, event_type, timestamp, payload FROM events
             ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn compact(&self, retain_sessions: &[String]) -> Result<u64, JournalError> {
        let _guard = self.write_lock.lock().await;
        // Build a placeholder list; retained sessions plus `_system`.
        let mut retained: Vec<&str> = vec![SYSTEM_SESSION_ID];
        retained.extend(retain_sessions.iter().map(String::as_str));
        let placeholders: Vec<String> = (1..=retained.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "DELETE FROM events WHERE session_id NOT IN ({})",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for s in &retained {
            query = query.bind(*s);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    async fn close(&self) -> Result<(), JournalError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Parse an RFC 3339 timestamp or fall back to now.
fn parse_rfc3339_or_now(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::SessionFailedPayload;

    fn failed(reason: &str) -> EventBody {
        EventBody::SessionFailed(SessionFailedPayload {
            reason: reason.to_owned(),
        })
    }

    #[tokio::test]
    async fn test_memory_emit_assigns_monotonic_seq() {
        let journal = MemoryJournal::new();
        let a = journal.emit("s1", failed("a")).await.expect("emit");
        let b = journal.emit("s2", failed("b")).await.expect("emit");
        let c = journal.emit("s1", failed("c")).await.expect("emit");
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));

        let s1 = journal.read_session("s1", 0, 100).await.expect("read");
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].seq, 1);
        assert_eq!(s1[1].seq, 3);
        assert_eq!(journal.count_session("s1").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn test_memory_read_session_offset_and_limit() {
        let journal = MemoryJournal::new();
        for i in 0..10 {
            journal
                .emit("s1", failed(&format!("e{i}")))
                .await
                .expect("emit");
        }
        let page = journal.read_session("s1", 4, 3).await.expect("read");
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_memory_subscribe_receives_in_order() {
        let journal = MemoryJournal::new();
        let mut rx = journal.subscribe();
        journal.emit("s1", failed("a")).await.expect("emit");
        journal.emit("s1", failed("b")).await.expect("emit");
        let first = rx.recv().await.expect("recv");
        let second = rx.recv().await.expect("recv");
        assert!(first.seq < second.seq);
    }

    #[tokio::test]
    async fn test_memory_compact_retains_system_events() {
        let journal = MemoryJournal::new();
        journal.emit("s1", failed("a")).await.expect("emit");
        journal.emit("s2", failed("b")).await.expect("emit");
        journal
            .emit(SYSTEM_SESSION_ID, failed("auth"))
            .await
            .expect("emit");

        let removed = journal
            .compact(&["s2".to_owned()])
            .await
            .expect("compact");
        assert_eq!(removed, 1);
        assert_eq!(journal.count_session("s1").await.expect("count"), 0);
        assert_eq!(journal.count_session("s2").await.expect("count"), 1);
        assert_eq!(
            journal
                .count_session(SYSTEM_SESSION_ID)
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn test_memory_emit_after_close_fails() {
        let journal = MemoryJournal::new();
        journal.close().await.expect("close");
        assert!(journal.emit("s1", failed("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.db");
        let journal = SqliteJournal::open(&path).await.expect("open");

        let a = journal.emit("s1", failed("a")).await.expect("emit");
        let b = journal.emit("s1", failed("b")).await.expect("emit");
        assert!(a.seq < b.seq);

        let events = journal.read_session("s1", 0, 100).await.expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "session.failed");
        assert_eq!(events[0].payload["reason"], "a");
        journal.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.db");
        {
            let journal = SqliteJournal::open(&path).await.expect("open");
            journal.emit("s1", failed("persisted")).await.expect("emit");
            journal.close().await.expect("close");
        }
        let journal = SqliteJournal::open(&path).await.expect("reopen");
        let events = journal.read_all().await.expect("read_all");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["reason"], "persisted");
        // Seq keeps increasing across reopen (AUTOINCREMENT).
        let next = journal.emit("s1", failed("later")).await.expect("emit");
        assert!(next.seq > events[0].seq);
        journal.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_sqlite_compact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.db");
        let journal = SqliteJournal::open(&path).await.expect("open");
        journal.emit("s1", failed("a")).await.expect("emit");
        journal.emit("s2", failed("b")).await.expect("emit");
        let removed = journal.compact(&["s1".to_owned()]).await.expect("compact");
        assert_eq!(removed, 1);
        assert_eq!(journal.count_session("s2").await.expect("count"), 0);
        journal.close().await.expect("close");
    }
}
