//! Database schema definitions for sessions, messages and compression records
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// Synthetic message standing in for a compressed span.
    CompressionSummary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::CompressionSummary => "compression",
        }
    }

    /// User and assistant messages are conversation turns; summaries are not.
    pub fn is_turn(&self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "compression" => Ok(Role::CompressionSummary),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}

/// Per-conversation aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sum of `token_count` over messages with `is_compressed = false`.
    pub total_token_count: i64,
    /// User and assistant turns only.
    pub message_count: i64,
    pub compression_count: i64,
}

impl Session {
    pub fn new(user_id: &str, session_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id
                .map(str::to_string)
                .unwrap_or_else(generate_session_id),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
            total_token_count: 0,
            message_count: 0,
            compression_count: 0,
        }
    }
}

/// A single entry of a session's append-only message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    /// Assigned by the store at insert time; `None` before that.
    pub sequence_number: Option<i64>,
    pub role: Role,
    pub content: String,
    pub token_count: i64,
    pub is_compressed: bool,
    pub compression_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A user or assistant message awaiting a sequence number.
    pub fn new_turn(session_id: &str, role: Role, content: &str, token_count: i64) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            session_id: session_id.to_string(),
            sequence_number: None,
            role,
            content: content.to_string(),
            token_count,
            is_compressed: false,
            compression_id: None,
            created_at: Utc::now(),
        }
    }

    /// The summary that replaces a compressed span. It takes the sequence
    /// number of the first message it replaces.
    pub fn new_summary(
        session_id: &str,
        content: &str,
        token_count: i64,
        sequence_number: i64,
    ) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            session_id: session_id.to_string(),
            sequence_number: Some(sequence_number),
            role: Role::CompressionSummary,
            content: content.to_string(),
            token_count,
            is_compressed: false,
            compression_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_summary(&self) -> bool {
        self.role == Role::CompressionSummary
    }

    /// `#<n>` for display, or `#pending` before the store has numbered it.
    pub fn seq_label(&self) -> String {
        match self.sequence_number {
            Some(seq) => format!("#{}", seq),
            None => "#pending".to_string(),
        }
    }
}

/// Immutable audit entry written once per successful compression round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub compression_id: String,
    pub session_id: String,
    /// 1-based, strictly increasing per session.
    pub round: i64,
    pub original_message_count: i64,
    pub compressed_token_count: i64,
    pub summary_token_count: i64,
    pub summary_content: String,
    pub compressed_message_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CompressionRecord {
    pub fn new_compression_id() -> String {
        format!("comp_{}", Uuid::new_v4().simple())
    }

    pub fn saved_tokens(&self) -> i64 {
        self.compressed_token_count - self.summary_token_count
    }

    /// `summary / compressed`; lower is better. Zero when nothing was compressed.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_token_count == 0 {
            return 0.0;
        }
        self.summary_token_count as f64 / self.compressed_token_count as f64
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub active_messages: i64,
    pub total_compressions: i64,
    pub database_size_bytes: i64,
}

pub fn generate_session_id() -> String {
    format!("session_{}", Uuid::new_v4().simple())
}

pub(crate) const MESSAGE_COLUMNS: &str = "message_id, session_id, sequence_number, role, content, \
     token_count, is_compressed, compression_id, created_at";

pub(crate) const SESSION_COLUMNS: &str = "session_id, user_id, created_at, updated_at, \
     total_token_count, message_count, compression_count";

pub(crate) const COMPRESSION_COLUMNS: &str = "compression_id, session_id, round, \
     original_message_count, compressed_token_count, summary_token_count, summary_content, \
     compressed_message_ids, created_at";

/// Version 1: sessions, messages, compression records.
pub const MIGRATION_001_INITIAL: &str = "
-- Sessions table
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    total_token_count INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    compression_count INTEGER NOT NULL DEFAULT 0
);
-- Messages table. A summary shares its sequence number with the first
-- message it replaces, so (session_id, sequence_number) is not unique.
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    token_count INTEGER NOT NULL CHECK (token_count >= 0),
    is_compressed BOOLEAN NOT NULL DEFAULT FALSE,
    compression_id TEXT,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(session_id)
);
-- Compression history
CREATE TABLE IF NOT EXISTS compression_records (
    compression_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    round INTEGER NOT NULL,
    original_message_count INTEGER NOT NULL,
    compressed_token_count INTEGER NOT NULL,
    summary_token_count INTEGER NOT NULL,
    summary_content TEXT NOT NULL,
    compressed_message_ids TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(session_id),
    UNIQUE(session_id, round)
);
CREATE INDEX IF NOT EXISTS idx_messages_session_seq ON messages (session_id, sequence_number);
CREATE INDEX IF NOT EXISTS idx_compression_session ON compression_records (session_id);
";

/// Version 2: partial index for the hot active-message query.
pub const MIGRATION_002_ACTIVE_INDEX: &str = "
CREATE INDEX IF NOT EXISTS idx_messages_active
    ON messages (session_id, sequence_number)
    WHERE is_compressed = 0;
CREATE INDEX IF NOT EXISTS idx_messages_compression ON messages (compression_id);
";
