//! Memory database module - SQLite-backed sessions, messages and compression history
pub mod schema;
pub mod migration;
pub mod session_store;
pub mod message_store;
pub mod compression_store;

pub use schema::*;
pub use migration::MigrationManager;
pub use session_store::SessionStore;
pub use message_store::MessageStore;
pub use compression_store::CompressionStore;

use crate::error::{ContextError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::TransactionBehavior;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;
     PRAGMA synchronous = NORMAL;";

/// Timestamps are written as RFC 3339, but rows touched by hand may carry
/// SQLite's own `CURRENT_TIMESTAMP` format. Unparseable values become "now".
pub(crate) fn parse_datetime_safe(datetime_str: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return DateTime::from_naive_utc_and_offset(dt, Utc);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return DateTime::from_naive_utc_and_offset(dt, Utc);
    }
    warn!("Unparseable timestamp '{}', using current time", datetime_str);
    Utc::now()
}

pub struct MemoryDatabase {
    pub sessions: SessionStore,
    pub messages: MessageStore,
    pub compressions: CompressionStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    /// Open (or create) a file database and bring its schema up to date.
    pub fn new(db_path: &Path) -> Result<Self> {
        info!("Opening context database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder().max_size(10).build(manager)?;

        {
            let mut conn = pool.get()?;
            let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            debug!("Journal mode: {}", mode);
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        info!("Context database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Private in-memory database. A single pooled connection, kept for the
    /// lifetime of the pool, so every store sees the same data.
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self {
            sessions: SessionStore::new(Arc::clone(&pool)),
            messages: MessageStore::new(Arc::clone(&pool)),
            compressions: CompressionStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    /// Run `f` inside `BEGIN IMMEDIATE`. Commits on `Ok`; any error drops the
    /// transaction, which rolls it back.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Append a message and fold it into the session counters in one commit.
    /// Summaries add tokens but do not count as turns.
    pub fn append_turn(&self, message: Message) -> Result<Message> {
        self.with_transaction(|tx| {
            let stored = self.messages.append_with_conn(tx, message)?;
            let turn_delta = if stored.role.is_turn() { 1 } else { 0 };
            self.sessions
                .apply_message_delta_with_conn(tx, &stored.session_id, stored.token_count, turn_delta)?;
            Ok(stored)
        })
    }

    /// Persist a finished compression round: flag the span, insert the
    /// summary and the record, and move the counters. All or nothing.
    ///
    /// The round number and the span's active state are checked again here,
    /// since the summary was produced outside any transaction.
    pub fn apply_compression(&self, record: &CompressionRecord, summary: Message) -> Result<(Message, Session)> {
        let session_id = record.session_id.clone();
        let outcome = self.with_transaction(|tx| {
            let rounds = self.compressions.count_rounds_with_conn(tx, &session_id)?;
            if record.round != rounds + 1 {
                return Err(ContextError::ConcurrentModification(format!(
                    "session {} expected round {} but {} rounds exist",
                    session_id, record.round, rounds
                )));
            }

            self.messages
                .mark_compressed_with_conn(tx, &record.compressed_message_ids, &record.compression_id)
                .map_err(|e| match e {
                    ContextError::MessageAlreadyCompressed(id) => ContextError::ConcurrentModification(
                        format!("message {} was compressed by another round", id),
                    ),
                    other => other,
                })?;

            let summary = self.messages.append_with_conn(tx, summary)?;
            self.compressions.insert_with_conn(tx, record)?;
            self.sessions.apply_compression_with_conn(
                tx,
                &session_id,
                record.compressed_token_count,
                record.summary_token_count,
            )?;

            let session = self
                .sessions
                .get_session_with_conn(tx, &session_id)?
                .ok_or_else(|| ContextError::SessionNotFound(session_id.clone()))?;
            Ok((summary, session))
        })?;

        debug!(
            "Applied compression {} to session {} (round {})",
            record.compression_id, session_id, record.round
        );
        Ok(outcome)
    }

    /// Recompute the counters from the message log and store them.
    pub fn recalculate_session_stats(&self, session_id: &str) -> Result<Session> {
        self.with_transaction(|tx| {
            if self.sessions.get_session_with_conn(tx, session_id)?.is_none() {
                return Err(ContextError::SessionNotFound(session_id.to_string()));
            }
            let (total_tokens, message_count) = self.messages.session_totals_with_conn(tx, session_id)?;
            self.sessions.set_stats_with_conn(tx, session_id, total_tokens, message_count)?;
            self.sessions
                .get_session_with_conn(tx, session_id)?
                .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
        })
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MemoryDatabase, Session) {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let (session, created) = db.sessions.insert_if_absent(&Session::new("u1", None)).unwrap();
        assert!(created);
        (db, session)
    }

    #[test]
    fn test_parse_datetime_formats() {
        let rfc = parse_datetime_safe("2024-03-01T10:00:00+00:00");
        let sqlite = parse_datetime_safe("2024-03-01 10:00:00");
        assert_eq!(rfc, sqlite);
    }

    #[test]
    fn test_append_turn_assigns_sequence_and_counts() {
        let (db, session) = seeded();
        let sid = &session.session_id;

        let first = db.append_turn(Message::new_turn(sid, Role::User, "hi", 3)).unwrap();
        let second = db.append_turn(Message::new_turn(sid, Role::Assistant, "hello", 5)).unwrap();
        assert_eq!(first.sequence_number, Some(0));
        assert_eq!(second.sequence_number, Some(1));

        let session = db.sessions.get_session(sid).unwrap().unwrap();
        assert_eq!(session.total_token_count, 8);
        assert_eq!(session.message_count, 2);
    }

    #[test]
    fn test_append_to_missing_session_leaves_nothing_behind() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let err = db
            .append_turn(Message::new_turn("ghost", Role::User, "hi", 1))
            .unwrap_err();
        assert!(matches!(err, ContextError::SessionNotFound(_)));
        assert_eq!(db.get_stats().unwrap().total_messages, 0);
    }

    #[test]
    fn test_mark_compressed_is_all_or_nothing() {
        let (db, session) = seeded();
        let sid = &session.session_id;
        let msg = db.append_turn(Message::new_turn(sid, Role::User, "a", 1)).unwrap();

        let ids = vec![msg.message_id.clone(), "msg_missing".to_string()];
        let err = db.messages.mark_compressed(&ids, "comp_x").unwrap_err();
        assert!(matches!(err, ContextError::MessageNotFound(_)));

        let active = db.messages.get_active_messages(sid, None).unwrap();
        assert_eq!(active.len(), 1);
        assert!(!active[0].is_compressed);
    }

    #[test]
    fn test_apply_compression_moves_counters() {
        let (db, session) = seeded();
        let sid = &session.session_id;
        let a = db.append_turn(Message::new_turn(sid, Role::User, "q", 40)).unwrap();
        let b = db.append_turn(Message::new_turn(sid, Role::Assistant, "a", 60)).unwrap();
        db.append_turn(Message::new_turn(sid, Role::User, "q2", 10)).unwrap();

        let record = CompressionRecord {
            compression_id: CompressionRecord::new_compression_id(),
            session_id: sid.clone(),
            round: 1,
            original_message_count: 2,
            compressed_token_count: 100,
            summary_token_count: 15,
            summary_content: "summary".into(),
            compressed_message_ids: vec![a.message_id.clone(), b.message_id.clone()],
            created_at: Utc::now(),
        };
        let summary = Message::new_summary(sid, "summary", 15, a.sequence_number.unwrap());
        let (summary, session) = db.apply_compression(&record, summary).unwrap();

        assert_eq!(summary.sequence_number, Some(0));
        assert_eq!(session.total_token_count, 25);
        assert_eq!(session.message_count, 3);
        assert_eq!(session.compression_count, 1);

        let active = db.messages.get_active_messages(sid, None).unwrap();
        assert_eq!(active.len(), 2);
        assert!(active[0].is_summary());

        let history = db.compressions.get_compression_history(sid).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].compressed_message_ids, record.compressed_message_ids);

        // Same round again is rejected without touching anything.
        let again = db
            .apply_compression(&record, Message::new_summary(sid, "summary", 15, 0))
            .unwrap_err();
        assert!(matches!(again, ContextError::ConcurrentModification(_)));
        let session = db.sessions.get_session(sid).unwrap().unwrap();
        assert_eq!(session.total_token_count, 25);
    }

    #[test]
    fn test_recalculate_repairs_drift() {
        let (db, session) = seeded();
        let sid = &session.session_id;
        db.append_turn(Message::new_turn(sid, Role::User, "q", 7)).unwrap();
        db.with_transaction(|tx| db.sessions.set_stats_with_conn(tx, sid, 999, 42))
            .unwrap();

        let repaired = db.recalculate_session_stats(sid).unwrap();
        assert_eq!(repaired.total_token_count, 7);
        assert_eq!(repaired.message_count, 1);
    }
}
