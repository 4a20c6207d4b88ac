//! Session records and their running counters
use crate::error::{ContextError, Result};
use crate::memory_db::parse_datetime_safe;
use crate::memory_db::schema::*;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, info};

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    Ok(Session {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: parse_datetime_safe(&created_at),
        updated_at: parse_datetime_safe(&updated_at),
        total_token_count: row.get(4)?,
        message_count: row.get(5)?,
        compression_count: row.get(6)?,
    })
}

pub struct SessionStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SessionStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Insert `session` unless its id is taken. Returns whichever record ends
    /// up stored and whether this call created it.
    pub fn insert_if_absent(&self, session: &Session) -> Result<(Session, bool)> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                SESSION_COLUMNS
            ),
            params![
                &session.session_id,
                &session.user_id,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.total_token_count,
                session.message_count,
                session.compression_count,
            ],
        )?;
        let stored = self
            .get_session_with_conn(&tx, &session.session_id)?
            .ok_or_else(|| ContextError::SessionNotFound(session.session_id.clone()))?;
        tx.commit()?;

        if inserted == 1 {
            info!("Created session {} for user {}", stored.session_id, stored.user_id);
        }
        Ok((stored, inserted == 1))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        self.get_session_with_conn(&conn, session_id)
    }

    pub fn get_session_with_conn(&self, conn: &Connection, session_id: &str) -> Result<Option<Session>> {
        let session = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS),
                [session_id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn get_all_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let sessions = match user_id {
            Some(user_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC",
                    SESSION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([user_id], row_to_session)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sessions ORDER BY updated_at DESC",
                    SESSION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_session)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(sessions)
    }

    /// Add a freshly appended message to the running totals.
    pub fn apply_message_delta_with_conn(
        &self,
        conn: &Connection,
        session_id: &str,
        token_delta: i64,
        message_delta: i64,
    ) -> Result<()> {
        let updated = conn.execute(
            "UPDATE sessions
             SET total_token_count = total_token_count + ?1,
                 message_count = message_count + ?2,
                 updated_at = ?3
             WHERE session_id = ?4",
            params![token_delta, message_delta, Utc::now().to_rfc3339(), session_id],
        )?;
        if updated == 0 {
            return Err(ContextError::SessionNotFound(session_id.to_string()));
        }
        debug!(
            "Session {} counters moved by tokens={:+}, messages={:+}",
            session_id, token_delta, message_delta
        );
        Ok(())
    }

    /// Swap a compressed span's tokens for its summary's and bump the round
    /// counter. Relative, so appends that landed meanwhile are kept.
    pub fn apply_compression_with_conn(
        &self,
        conn: &Connection,
        session_id: &str,
        compressed_tokens: i64,
        summary_tokens: i64,
    ) -> Result<()> {
        let updated = conn.execute(
            "UPDATE sessions
             SET total_token_count = total_token_count - ?1 + ?2,
                 compression_count = compression_count + 1,
                 updated_at = ?3
             WHERE session_id = ?4",
            params![compressed_tokens, summary_tokens, Utc::now().to_rfc3339(), session_id],
        )?;
        if updated == 0 {
            return Err(ContextError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Overwrite the counters with absolute values.
    pub fn set_stats_with_conn(
        &self,
        conn: &Connection,
        session_id: &str,
        total_tokens: i64,
        message_count: i64,
    ) -> Result<()> {
        let updated = conn.execute(
            "UPDATE sessions
             SET total_token_count = ?1, message_count = ?2, updated_at = ?3
             WHERE session_id = ?4",
            params![total_tokens, message_count, Utc::now().to_rfc3339(), session_id],
        )?;
        if updated == 0 {
            return Err(ContextError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::memory_db::{MemoryDatabase, Session};

    #[test]
    fn test_insert_if_absent_keeps_first_record() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let (first, created) = db.sessions.insert_if_absent(&Session::new("alice", Some("s1"))).unwrap();
        assert!(created);
        let (second, created) = db.sessions.insert_if_absent(&Session::new("bob", Some("s1"))).unwrap();
        assert!(!created);
        assert_eq!(second.user_id, first.user_id);
    }

    #[test]
    fn test_list_sessions_by_user() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.sessions.insert_if_absent(&Session::new("alice", None)).unwrap();
        db.sessions.insert_if_absent(&Session::new("alice", None)).unwrap();
        db.sessions.insert_if_absent(&Session::new("bob", None)).unwrap();

        assert_eq!(db.sessions.get_all_sessions(None).unwrap().len(), 3);
        let alice = db.sessions.get_all_sessions(Some("alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|s| s.user_id == "alice"));
    }

    #[test]
    fn test_counter_updates_on_missing_session_fail() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let err = db
            .with_transaction(|tx| db.sessions.apply_message_delta_with_conn(tx, "ghost", 5, 1))
            .unwrap_err();
        assert!(matches!(err, crate::ContextError::SessionNotFound(_)));
    }
}
