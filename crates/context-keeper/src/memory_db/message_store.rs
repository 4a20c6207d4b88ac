//! Append-only message log with compression flags
use crate::error::{ContextError, Result};
use crate::memory_db::parse_datetime_safe;
use crate::memory_db::schema::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, info};

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

pub(crate) fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let created_at: String = row.get(8)?;
    Ok(Message {
        message_id: row.get(0)?,
        session_id: row.get(1)?,
        sequence_number: Some(row.get(2)?),
        role: row.get(3)?,
        content: row.get(4)?,
        token_count: row.get(5)?,
        is_compressed: row.get(6)?,
        compression_id: row.get(7)?,
        created_at: parse_datetime_safe(&created_at),
    })
}

pub struct MessageStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MessageStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Append a message, assigning the next sequence number for its session
    /// when it does not carry one. The caller's connection must be inside a
    /// write transaction so the read-then-insert cannot interleave.
    pub fn append_with_conn(&self, conn: &Connection, mut message: Message) -> Result<Message> {
        let exists = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE session_id = ?1",
                [&message.session_id],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(ContextError::SessionNotFound(message.session_id));
        }

        let seq = match message.sequence_number {
            Some(seq) => seq,
            None => {
                let next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(sequence_number), -1) + 1 FROM messages WHERE session_id = ?1",
                    [&message.session_id],
                    |row| row.get(0),
                )?;
                debug!("Assigned sequence_number={} to {}", next, message.message_id);
                next
            }
        };

        conn.execute(
            &format!(
                "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                MESSAGE_COLUMNS
            ),
            params![
                &message.message_id,
                &message.session_id,
                seq,
                message.role,
                &message.content,
                message.token_count,
                message.is_compressed,
                &message.compression_id,
                message.created_at.to_rfc3339(),
            ],
        )?;

        message.sequence_number = Some(seq);
        Ok(message)
    }

    /// Append on its own transaction, without touching session counters.
    pub fn append(&self, message: Message) -> Result<Message> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = self.append_with_conn(&tx, message)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Active messages ordered by sequence number. With a limit, only the
    /// most recent `limit` are returned, still in ascending order.
    pub fn get_active_messages(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let conn = self.get_conn()?;
        self.get_active_messages_with_conn(&conn, session_id, limit)
    }

    pub fn get_active_messages_with_conn(
        &self,
        conn: &Connection,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let messages = match limit {
            Some(limit) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages
                     WHERE session_id = ?1 AND is_compressed = 0
                     ORDER BY sequence_number DESC, rowid DESC
                     LIMIT ?2",
                    MESSAGE_COLUMNS
                ))?;
                let mut recent = stmt
                    .query_map(params![session_id, limit as i64], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                recent.reverse();
                recent
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages
                     WHERE session_id = ?1 AND is_compressed = 0
                     ORDER BY sequence_number ASC, rowid ASC",
                    MESSAGE_COLUMNS
                ))?;
                let all = stmt
                    .query_map([session_id], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                all
            }
        };
        Ok(messages)
    }

    /// The full audit log, compressed messages included.
    pub fn get_all_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY sequence_number ASC, rowid ASC",
            MESSAGE_COLUMNS
        ))?;
        let messages = stmt
            .query_map([session_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Flip `is_compressed` for every id. Fails on the first id that is
    /// missing or already compressed; the caller's transaction then rolls
    /// the whole batch back.
    pub fn mark_compressed_with_conn(
        &self,
        conn: &Connection,
        message_ids: &[String],
        compression_id: &str,
    ) -> Result<()> {
        let mut stmt = conn.prepare(
            "UPDATE messages SET is_compressed = 1, compression_id = ?1
             WHERE message_id = ?2 AND is_compressed = 0",
        )?;
        for id in message_ids {
            if stmt.execute(params![compression_id, id])? == 1 {
                continue;
            }
            let found = conn
                .query_row("SELECT 1 FROM messages WHERE message_id = ?1", [id], |_| Ok(()))
                .optional()?;
            return Err(match found {
                Some(()) => ContextError::MessageAlreadyCompressed(id.clone()),
                None => ContextError::MessageNotFound(id.clone()),
            });
        }
        Ok(())
    }

    pub fn mark_compressed(&self, message_ids: &[String], compression_id: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.mark_compressed_with_conn(&tx, message_ids, compression_id)?;
        tx.commit()?;
        info!("Marked {} messages as compressed ({})", message_ids.len(), compression_id);
        Ok(())
    }

    /// Ground truth for session counters: tokens over active messages and
    /// the number of user/assistant turns ever logged.
    ///
    /// The turn count deliberately includes compressed messages, unlike a
    /// count over the active view. Compression leaves `message_count`
    /// untouched, so this is the only definition that agrees with the
    /// running counter and keeps a repair on a healthy session a no-op.
    pub fn session_totals_with_conn(&self, conn: &Connection, session_id: &str) -> Result<(i64, i64)> {
        let totals = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN is_compressed = 0 THEN token_count ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN role IN ('user', 'assistant') THEN 1 ELSE 0 END), 0)
             FROM messages WHERE session_id = ?1",
            [session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use crate::memory_db::{MemoryDatabase, Message, Role, Session};
    use crate::ContextError;

    fn db_with_session() -> (MemoryDatabase, String) {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let (session, _) = db.sessions.insert_if_absent(&Session::new("u", None)).unwrap();
        (db, session.session_id)
    }

    #[test]
    fn test_append_does_not_touch_counters() {
        let (db, sid) = db_with_session();
        let stored = db.messages.append(Message::new_turn(&sid, Role::User, "hi", 2)).unwrap();
        assert_eq!(stored.sequence_number, Some(0));
        assert_eq!(db.sessions.get_session(&sid).unwrap().unwrap().total_token_count, 0);
    }

    #[test]
    fn test_limit_returns_most_recent_in_order() {
        let (db, sid) = db_with_session();
        for i in 0..5 {
            db.messages
                .append(Message::new_turn(&sid, Role::User, &format!("m{}", i), 1))
                .unwrap();
        }
        let recent = db.messages.get_active_messages(&sid, Some(2)).unwrap();
        let seqs: Vec<_> = recent.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, [Some(3), Some(4)]);
    }

    #[test]
    fn test_compressed_messages_leave_the_active_view() {
        let (db, sid) = db_with_session();
        let a = db.messages.append(Message::new_turn(&sid, Role::User, "a", 1)).unwrap();
        db.messages.append(Message::new_turn(&sid, Role::Assistant, "b", 1)).unwrap();

        db.messages.mark_compressed(&[a.message_id.clone()], "comp_1").unwrap();
        let active = db.messages.get_active_messages(&sid, None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].content, "b");

        let all = db.messages.get_all_messages(&sid).unwrap();
        assert_eq!(all[0].compression_id.as_deref(), Some("comp_1"));

        let err = db.messages.mark_compressed(&[a.message_id], "comp_2").unwrap_err();
        assert!(matches!(err, ContextError::MessageAlreadyCompressed(_)));
    }

    #[test]
    fn test_totals_skip_compressed_tokens_but_count_turns() {
        let (db, sid) = db_with_session();
        let a = db.messages.append(Message::new_turn(&sid, Role::User, "a", 10)).unwrap();
        db.messages.append(Message::new_turn(&sid, Role::Assistant, "b", 20)).unwrap();
        db.messages.mark_compressed(&[a.message_id], "comp_1").unwrap();
        db.messages.append(Message::new_summary(&sid, "s", 3, 0)).unwrap();

        let conn = db.messages.get_conn().unwrap();
        let (tokens, turns) = db.messages.session_totals_with_conn(&conn, &sid).unwrap();
        assert_eq!(tokens, 23);
        assert_eq!(turns, 2);
    }
}
