//! Error taxonomy for session and compression operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected precondition. Nothing was mutated.
    Input,
    /// No clean user/assistant boundary to cut on.
    Boundary,
    /// The summarization call failed, timed out or returned garbage.
    Summarization,
    /// Another writer got there first.
    Concurrency,
    /// The durable store failed.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Boundary => "boundary",
            ErrorKind::Summarization => "summarization",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("message already compressed: {0}")]
    MessageAlreadyCompressed(String),

    #[error("no active messages to compress")]
    EmptyMessages,

    #[error("token count below compression threshold: {total} <= {threshold}")]
    BelowThreshold { total: i64, threshold: i64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not find a valid split point (no assistant message before the boundary)")]
    BoundaryNotFound,

    #[error("invalid split index {index} for {len} messages")]
    InvalidSplit { index: usize, len: usize },

    #[error("summary generation failed: {0}")]
    Summarization(String),

    #[error("summary does not match the expected structure: {0}")]
    MalformedSummary(String),

    #[error("summary generation timed out after {0}s")]
    SummaryTimeout(u64),

    #[error("compression already running for session {0}")]
    CompressionInProgress(String),

    #[error("concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::SessionNotFound(_)
            | ContextError::MessageNotFound(_)
            | ContextError::MessageAlreadyCompressed(_)
            | ContextError::EmptyMessages
            | ContextError::BelowThreshold { .. }
            | ContextError::InvalidConfig(_) => ErrorKind::Input,
            ContextError::BoundaryNotFound | ContextError::InvalidSplit { .. } => ErrorKind::Boundary,
            ContextError::Summarization(_)
            | ContextError::MalformedSummary(_)
            | ContextError::SummaryTimeout(_) => ErrorKind::Summarization,
            ContextError::CompressionInProgress(_) | ContextError::ConcurrentModification(_) => {
                ErrorKind::Concurrency
            }
            ContextError::Database(_)
            | ContextError::Pool(_)
            | ContextError::Serialization(_)
            | ContextError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Whether the conversation can carry on and retry later. Input errors are
    /// caller bugs; everything else clears up on a later attempt or a repair.
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Input
    }
}
