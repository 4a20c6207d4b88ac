//! Session Manager
//!
//! Entry point for the upstream workflow: session lifecycle, message
//! ingestion with token accounting, and compression triggering.
use crate::config::ContextConfig;
use crate::context_engine::{CompressionEngine, Summarizer};
use crate::error::{ContextError, Result};
use crate::memory_db::{CompressionRecord, MemoryDatabase, Message, Role, Session};
use crate::metrics;
use crate::tokens::TokenCounter;
use crate::utils::preview;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Budget figures exposed to callers alongside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionBudget {
    pub total_tokens: i64,
    pub max_context_tokens: i64,
    pub threshold_tokens: i64,
    /// Negative once the session is over budget.
    pub available_tokens: i64,
    pub compression_count: i64,
}

pub struct SessionManager {
    db: Arc<MemoryDatabase>,
    engine: CompressionEngine,
    counter: Arc<dyn TokenCounter>,
    config: Arc<ContextConfig>,
}

impl SessionManager {
    pub fn new(
        db: Arc<MemoryDatabase>,
        summarizer: Arc<dyn Summarizer>,
        counter: Arc<dyn TokenCounter>,
        config: Arc<ContextConfig>,
    ) -> Self {
        let engine = CompressionEngine::new(
            Arc::clone(&db),
            summarizer,
            Arc::clone(&counter),
            Arc::clone(&config),
        );
        Self {
            db,
            engine,
            counter,
            config,
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Create a session with zero counters. An id that is already taken is
    /// not an error: the existing session comes back untouched.
    pub fn create_session(&self, user_id: &str, session_id: Option<&str>) -> Result<Session> {
        let (session, created) = self.db.sessions.insert_if_absent(&Session::new(user_id, session_id))?;
        if !created {
            debug!("Session {} already exists, reusing it", session.session_id);
        }
        Ok(session)
    }

    /// Existing session for `session_id`, or a new one under that id (or a
    /// generated id when none is given).
    pub fn get_or_create_session(&self, session_id: Option<&str>, user_id: &str) -> Result<Session> {
        if let Some(id) = session_id {
            if let Some(session) = self.db.sessions.get_session(id)? {
                return Ok(session);
            }
            info!("Session {} not found, creating it", id);
        }
        self.create_session(user_id, session_id)
    }

    pub fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.db.sessions.get_session(session_id)
    }

    /// Sessions ordered by last activity, optionally for one user.
    pub fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        self.db.sessions.get_all_sessions(user_id)
    }

    fn require_session(&self, session_id: &str) -> Result<Session> {
        self.load_session(session_id)?
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
    }

    pub fn add_user_message(&self, session_id: &str, content: &str) -> Result<Message> {
        self.add_message(session_id, Role::User, content)
    }

    pub fn add_assistant_message(&self, session_id: &str, content: &str) -> Result<Message> {
        self.add_message(session_id, Role::Assistant, content)
    }

    fn add_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        let tokens = self.counter.count_tokens(content, &self.config.model_name) as i64;
        let message = self
            .db
            .append_turn(Message::new_turn(session_id, role, content, tokens))?;

        metrics::inc_message_appended(role.as_str());
        debug!(
            "Session {}: {} message {} ({} tokens): {}",
            session_id,
            role,
            message.seq_label(),
            tokens,
            preview(content, 60)
        );
        Ok(message)
    }

    /// Active messages in order; with a window, only the most recent ones.
    pub fn get_conversation_history(&self, session_id: &str, window_size: Option<usize>) -> Result<Vec<Message>> {
        self.db.messages.get_active_messages(session_id, window_size)
    }

    /// Every message ever logged, compressed ones included.
    pub fn get_all_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.db.messages.get_all_messages(session_id)
    }

    pub fn get_compression_history(&self, session_id: &str) -> Result<Vec<CompressionRecord>> {
        self.db.compressions.get_compression_history(session_id)
    }

    pub fn check_compression_needed(&self, session_id: &str) -> Result<bool> {
        let session = self.require_session(session_id)?;
        let threshold = self.config.compression_threshold_tokens();
        let needed = session.total_token_count > threshold;
        if needed {
            warn!(
                "Session {} over compression threshold: {} > {}",
                session_id, session.total_token_count, threshold
            );
        }
        Ok(needed)
    }

    pub async fn trigger_compression(&self, session_id: &str) -> Result<CompressionRecord> {
        self.engine.compress_session(session_id).await
    }

    /// Check the threshold and compress if needed. Failures are logged and
    /// swallowed; the session keeps working uncompressed until a later try.
    pub async fn maybe_compress(&self, session_id: &str) -> Option<CompressionRecord> {
        match self.check_compression_needed(session_id) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("Compression check failed for session {}: {}", session_id, e);
                return None;
            }
        }
        match self.trigger_compression(session_id).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    "Continuing session {} without compression ({} error): {}",
                    session_id,
                    e.kind().as_str(),
                    e
                );
                None
            }
        }
    }

    /// Rebuild the counters from the message log. Never raises: returns
    /// false and logs on any failure.
    pub fn recalculate_session_stats(&self, session_id: &str) -> bool {
        match self.db.recalculate_session_stats(session_id) {
            Ok(session) => {
                info!(
                    "Recalculated stats for session {}: tokens={}, messages={}",
                    session_id, session.total_token_count, session.message_count
                );
                true
            }
            Err(e) => {
                error!("Failed to recalculate stats for session {}: {}", session_id, e);
                false
            }
        }
    }

    /// Tokens over active messages, read from the log rather than the counter.
    pub fn calculate_session_tokens(&self, session_id: &str) -> Result<i64> {
        let messages = self.db.messages.get_active_messages(session_id, None)?;
        Ok(messages.iter().map(|m| m.token_count).sum())
    }

    pub fn get_available_tokens(&self, session_id: &str) -> Result<i64> {
        let session = self.require_session(session_id)?;
        Ok(self.config.max_context_tokens - session.total_token_count)
    }

    pub fn budget(&self, session_id: &str) -> Result<SessionBudget> {
        let session = self.require_session(session_id)?;
        Ok(SessionBudget {
            total_tokens: session.total_token_count,
            max_context_tokens: self.config.max_context_tokens,
            threshold_tokens: self.config.compression_threshold_tokens(),
            available_tokens: self.config.max_context_tokens - session.total_token_count,
            compression_count: session.compression_count,
        })
    }
}
