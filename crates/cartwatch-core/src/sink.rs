//! Durable persistence for finalized session summaries.
//!
//! Writes are idempotent upserts keyed by `session_id`: replaying a
//! finalize after a crash overwrites the row with identical values instead
//! of duplicating it. The engine calls the sink through [`SessionSink`] so
//! tests can substitute [`MemorySink`] with scripted failures.
//!
//! Summaries that exhaust their retry budget land in the bounded
//! [`DeadLetterQueue`] rather than stalling the pipeline.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::warn;

use crate::error::SinkError;
use crate::summary::SessionSummary;

/// A durable store for session summaries.
pub trait SessionSink: Send + Sync {
    /// Insert or overwrite the summary row for its session id.
    fn persist(&self, summary: &SessionSummary) -> Result<(), SinkError>;

    /// Read back a summary, if present.
    fn fetch(&self, session_id: &str) -> Result<Option<SessionSummary>, SinkError>;

    /// Number of stored summaries.
    fn count(&self) -> Result<u64, SinkError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_summaries (
    session_id               TEXT PRIMARY KEY,
    user_id                  INTEGER NOT NULL,
    start_time               TEXT NOT NULL,
    end_time                 TEXT NOT NULL,
    last_activity            TEXT NOT NULL,
    device_type              TEXT NOT NULL,
    browser                  TEXT NOT NULL,
    page_views               INTEGER NOT NULL,
    products_viewed          INTEGER NOT NULL,
    unique_products_viewed   INTEGER NOT NULL,
    searches                 INTEGER NOT NULL,
    cart_additions           INTEGER NOT NULL,
    cart_removals            INTEGER NOT NULL,
    cart_value               REAL NOT NULL,
    is_converted             INTEGER NOT NULL,
    purchase_value           REAL NOT NULL,
    is_cart_abandoned        INTEGER NOT NULL,
    abandonment_reason       TEXT,
    time_in_cart_seconds     INTEGER NOT NULL,
    checkout_initiated       INTEGER NOT NULL,
    persona                  TEXT,
    final_phase              TEXT NOT NULL,
    session_duration_seconds INTEGER NOT NULL,
    avg_time_per_page        REAL NOT NULL,
    bounce                   INTEGER NOT NULL,
    updated_at               TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_user ON session_summaries(user_id);
CREATE INDEX IF NOT EXISTS idx_summaries_abandoned
    ON session_summaries(is_cart_abandoned);
";

const UPSERT: &str = "
INSERT INTO session_summaries (
    session_id, user_id, start_time, end_time, last_activity, device_type,
    browser, page_views, products_viewed, unique_products_viewed, searches,
    cart_additions, cart_removals, cart_value, is_converted, purchase_value,
    is_cart_abandoned, abandonment_reason, time_in_cart_seconds,
    checkout_initiated, persona, final_phase, session_duration_seconds,
    avg_time_per_page, bounce, updated_at
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
)
ON CONFLICT(session_id) DO UPDATE SET
    user_id = excluded.user_id,
    start_time = excluded.start_time,
    end_time = excluded.end_time,
    last_activity = excluded.last_activity,
    device_type = excluded.device_type,
    browser = excluded.browser,
    page_views = excluded.page_views,
    products_viewed = excluded.products_viewed,
    unique_products_viewed = excluded.unique_products_viewed,
    searches = excluded.searches,
    cart_additions = excluded.cart_additions,
    cart_removals = excluded.cart_removals,
    cart_value = excluded.cart_value,
    is_converted = excluded.is_converted,
    purchase_value = excluded.purchase_value,
    is_cart_abandoned = excluded.is_cart_abandoned,
    abandonment_reason = excluded.abandonment_reason,
    time_in_cart_seconds = excluded.time_in_cart_seconds,
    checkout_initiated = excluded.checkout_initiated,
    persona = excluded.persona,
    final_phase = excluded.final_phase,
    session_duration_seconds = excluded.session_duration_seconds,
    avg_time_per_page = excluded.avg_time_per_page,
    bounce = excluded.bounce,
    updated_at = excluded.updated_at
";

/// SQLite-backed summary store.
#[derive(Debug)]
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SessionSink for SqliteSink {
    fn persist(&self, summary: &SessionSummary) -> Result<(), SinkError> {
        let conn = self.lock();
        conn.execute(
            UPSERT,
            params![
                summary.session_id,
                summary.user_id as i64,
                summary.start_time,
                summary.end_time,
                summary.last_activity,
                summary.device_type,
                summary.browser,
                summary.page_views,
                summary.products_viewed,
                summary.unique_products_viewed,
                summary.searches,
                summary.cart_additions,
                summary.cart_removals,
                summary.cart_value,
                summary.is_converted,
                summary.purchase_value,
                summary.is_cart_abandoned,
                summary.abandonment_reason,
                summary.time_in_cart_seconds as i64,
                summary.checkout_initiated,
                summary.persona,
                summary.final_phase,
                summary.session_duration_seconds as i64,
                summary.avg_time_per_page,
                summary.bounce,
                summary.updated_at,
            ],
        )?;
        Ok(())
    }

    fn fetch(&self, session_id: &str) -> Result<Option<SessionSummary>, SinkError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, start_time, end_time, last_activity,
                    device_type, browser, page_views, products_viewed,
                    unique_products_viewed, searches, cart_additions,
                    cart_removals, cart_value, is_converted, purchase_value,
                    is_cart_abandoned, abandonment_reason, time_in_cart_seconds,
                    checkout_initiated, persona, final_phase,
                    session_duration_seconds, avg_time_per_page, bounce,
                    updated_at
             FROM session_summaries WHERE session_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![session_id], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                user_id: row.get::<_, i64>(1)? as u64,
                start_time: row.get(2)?,
                end_time: row.get(3)?,
                last_activity: row.get(4)?,
                device_type: row.get(5)?,
                browser: row.get(6)?,
                page_views: row.get(7)?,
                products_viewed: row.get(8)?,
                unique_products_viewed: row.get(9)?,
                searches: row.get(10)?,
                cart_additions: row.get(11)?,
                cart_removals: row.get(12)?,
                cart_value: row.get(13)?,
                is_converted: row.get(14)?,
                purchase_value: row.get(15)?,
                is_cart_abandoned: row.get(16)?,
                abandonment_reason: row.get(17)?,
                time_in_cart_seconds: row.get::<_, i64>(18)? as u64,
                checkout_initiated: row.get(19)?,
                persona: row.get(20)?,
                final_phase: row.get(21)?,
                session_duration_seconds: row.get::<_, i64>(22)? as u64,
                avg_time_per_page: row.get(23)?,
                bounce: row.get(24)?,
                updated_at: row.get(25)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn count(&self) -> Result<u64, SinkError> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM session_summaries", [], |row| {
            row.get(0)
        })?;
        Ok(n as u64)
    }
}

#[derive(Debug, Default)]
struct MemorySinkInner {
    rows: HashMap<String, SessionSummary>,
    /// Scripted failures consumed before any write succeeds.
    failures: VecDeque<SinkError>,
    writes_attempted: u64,
}

/// In-memory sink with scriptable failures, for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<MemorySinkInner>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySinkInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue `count` transient failures ahead of the next writes.
    pub fn fail_next_transient(&self, count: u32) {
        let mut inner = self.lock();
        for _ in 0..count {
            inner
                .failures
                .push_back(SinkError::Transient("injected outage".to_string()));
        }
    }

    /// Queue one permanent failure ahead of the next write.
    pub fn fail_next_permanent(&self) {
        self.lock()
            .failures
            .push_back(SinkError::Permanent("injected rejection".to_string()));
    }

    /// Total persist calls, including failed ones.
    #[must_use]
    pub fn writes_attempted(&self) -> u64 {
        self.lock().writes_attempted
    }
}

impl SessionSink for MemorySink {
    fn persist(&self, summary: &SessionSummary) -> Result<(), SinkError> {
        let mut inner = self.lock();
        inner.writes_attempted += 1;
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }
        inner
            .rows
            .insert(summary.session_id.clone(), summary.clone());
        Ok(())
    }

    fn fetch(&self, session_id: &str) -> Result<Option<SessionSummary>, SinkError> {
        Ok(self.lock().rows.get(session_id).cloned())
    }

    fn count(&self) -> Result<u64, SinkError> {
        Ok(self.lock().rows.len() as u64)
    }
}

/// Bounded holding area for summaries whose writes exhausted their retries.
///
/// Drop-oldest on overflow; the drop is logged and counted, never silent.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<SessionSummary>>,
    capacity: usize,
    dropped: std::sync::atomic::AtomicU64,
}

impl DeadLetterQueue {
    /// Create a queue holding at most `capacity` summaries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Add a failed summary, evicting the oldest when full.
    pub fn push(&self, summary: SessionSummary) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                self.dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(
                    session_id = %evicted.session_id,
                    "dead-letter queue full; dropping oldest summary"
                );
            }
        }
        entries.push_back(summary);
    }

    /// Remove and return everything, oldest first (redrive path).
    #[must_use]
    pub fn drain(&self) -> Vec<SessionSummary> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.drain(..).collect()
    }

    /// Current queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries evicted due to overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::{cart_event, event};
    use crate::event::EventType;
    use crate::session::{FinalizeCause, SessionState};

    const T0: u64 = 1_700_000_000_000;

    fn summary(session_id: &str, cart_value: f64) -> SessionSummary {
        let start = event("e1", session_id, EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 8);
        state.apply(&start);
        if cart_value > 0.0 {
            state.apply(&cart_event(
                "e2",
                session_id,
                EventType::AddToCart,
                T0 + 1000,
                cart_value,
                1,
                3,
            ));
        }
        state.finalize(FinalizeCause::Timeout).unwrap();
        SessionSummary::build(&state, None, T0 + 61_000)
    }

    #[test]
    fn sqlite_roundtrip() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let s = summary("s1", 45.0);
        sink.persist(&s).unwrap();
        let got = sink.fetch("s1").unwrap().unwrap();
        assert_eq!(got, s);
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn sqlite_upsert_is_idempotent() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let s = summary("s1", 45.0);
        sink.persist(&s).unwrap();
        sink.persist(&s).unwrap();
        assert_eq!(sink.count().unwrap(), 1);
        assert_eq!(sink.fetch("s1").unwrap().unwrap(), s);
    }

    #[test]
    fn sqlite_upsert_overwrites() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let mut s = summary("s1", 45.0);
        sink.persist(&s).unwrap();
        s.page_views = 99;
        sink.persist(&s).unwrap();
        assert_eq!(sink.fetch("s1").unwrap().unwrap().page_views, 99);
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn sqlite_fetch_missing_is_none() {
        let sink = SqliteSink::open_in_memory().unwrap();
        assert!(sink.fetch("nope").unwrap().is_none());
    }

    #[test]
    fn sqlite_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summaries.db");
        {
            let sink = SqliteSink::open(&path).unwrap();
            sink.persist(&summary("s1", 10.0)).unwrap();
        }
        let reopened = SqliteSink::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }

    #[test]
    fn memory_sink_scripted_failures() {
        let sink = MemorySink::new();
        sink.fail_next_transient(2);
        let s = summary("s1", 45.0);

        assert!(matches!(sink.persist(&s), Err(SinkError::Transient(_))));
        assert!(sink.persist(&s).is_err());
        sink.persist(&s).unwrap();
        assert_eq!(sink.writes_attempted(), 3);
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn dead_letter_queue_drops_oldest() {
        let dlq = DeadLetterQueue::new(2);
        dlq.push(summary("s1", 1.0));
        dlq.push(summary("s2", 2.0));
        dlq.push(summary("s3", 3.0));

        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.dropped(), 1);
        let drained = dlq.drain();
        assert_eq!(drained[0].session_id, "s2");
        assert_eq!(drained[1].session_id, "s3");
        assert!(dlq.is_empty());
    }
}
