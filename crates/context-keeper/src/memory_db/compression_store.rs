//! Compression history: one immutable record per successful round
use crate::error::Result;
use crate::memory_db::parse_datetime_safe;
use crate::memory_db::schema::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tracing::debug;

fn row_to_record(row: &Row) -> rusqlite::Result<CompressionRecord> {
    let ids_json: String = row.get(7)?;
    let compressed_message_ids: Vec<String> = serde_json::from_str(&ids_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    let created_at: String = row.get(8)?;

    Ok(CompressionRecord {
        compression_id: row.get(0)?,
        session_id: row.get(1)?,
        round: row.get(2)?,
        original_message_count: row.get(3)?,
        compressed_token_count: row.get(4)?,
        summary_token_count: row.get(5)?,
        summary_content: row.get(6)?,
        compressed_message_ids,
        created_at: parse_datetime_safe(&created_at),
    })
}

pub struct CompressionStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl CompressionStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn insert_with_conn(&self, conn: &Connection, record: &CompressionRecord) -> Result<()> {
        debug!(
            "Storing compression record {} (session {}, round {})",
            record.compression_id, record.session_id, record.round
        );
        conn.execute(
            &format!(
                "INSERT INTO compression_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                COMPRESSION_COLUMNS
            ),
            params![
                &record.compression_id,
                &record.session_id,
                record.round,
                record.original_message_count,
                record.compressed_token_count,
                record.summary_token_count,
                &record.summary_content,
                serde_json::to_string(&record.compressed_message_ids)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Records for a session, oldest round first.
    pub fn get_compression_history(&self, session_id: &str) -> Result<Vec<CompressionRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM compression_records WHERE session_id = ?1 ORDER BY round ASC",
            COMPRESSION_COLUMNS
        ))?;
        let records = stmt
            .query_map([session_id], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_rounds_with_conn(&self, conn: &Connection, session_id: &str) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM compression_records WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_rounds(&self, session_id: &str) -> Result<i64> {
        let conn = self.get_conn()?;
        self.count_rounds_with_conn(&conn, session_id)
    }
}
