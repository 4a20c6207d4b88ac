//! Compression Engine
//!
//! Turns the oldest part of a session's active history into one structured
//! summary message. A round has two halves:
//!
//! 1. [`CompressionEngine::compress`] picks the split, asks the summarizer and
//!    builds the summary message and record. It reads, but never writes.
//! 2. [`CompressionEngine::apply`] commits the result in one transaction.
//!
//! [`CompressionEngine::compress_session`] runs both under a per-session lock.
use crate::config::ContextConfig;
use crate::context_engine::prompt::{build_compression_prompt, validate_summary};
use crate::context_engine::split::find_split_point;
use crate::context_engine::Summarizer;
use crate::error::{ContextError, Result};
use crate::memory_db::{CompressionRecord, MemoryDatabase, Message, Session};
use crate::metrics;
use crate::tokens::TokenCounter;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Everything a round produced before it is written.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub compressed: Vec<Message>,
    pub summary_message: Message,
    pub record: CompressionRecord,
}

pub struct CompressionEngine {
    db: Arc<MemoryDatabase>,
    summarizer: Arc<dyn Summarizer>,
    counter: Arc<dyn TokenCounter>,
    config: Arc<ContextConfig>,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CompressionEngine {
    pub fn new(
        db: Arc<MemoryDatabase>,
        summarizer: Arc<dyn Summarizer>,
        counter: Arc<dyn TokenCounter>,
        config: Arc<ContextConfig>,
    ) -> Self {
        Self {
            db,
            summarizer,
            counter,
            config,
            session_locks: DashMap::new(),
        }
    }

    pub fn threshold_tokens(&self) -> i64 {
        self.config.compression_threshold_tokens()
    }

    /// Plan a round over `messages`, the active history of one session in
    /// sequence order. Nothing is written.
    pub async fn compress(&self, messages: &[Message]) -> Result<CompressionOutcome> {
        let first = messages.first().ok_or(ContextError::EmptyMessages)?;
        let session_id = first.session_id.clone();

        let total: i64 = messages.iter().map(|m| m.token_count).sum();
        let threshold = self.threshold_tokens();
        if total <= threshold {
            return Err(ContextError::BelowThreshold { total, threshold });
        }

        let split = find_split_point(messages, self.config.compression_preserve_ratio)?;
        let to_compress = &messages[..split.index];
        info!(
            "Session {}: compressing {} messages ({} tokens), preserving {} ({} tokens)",
            session_id,
            split.index,
            split.compressed_tokens(),
            messages.len() - split.index,
            split.preserved_tokens
        );

        let summary_content = self.summarize(to_compress).await?;
        let summary_tokens = self
            .counter
            .count_tokens(&summary_content, &self.config.model_name) as i64;

        let start_seq = to_compress[0]
            .sequence_number
            .ok_or_else(|| ContextError::MessageNotFound(to_compress[0].message_id.clone()))?;
        let round = self.db.compressions.count_rounds(&session_id)? + 1;

        let record = CompressionRecord {
            compression_id: CompressionRecord::new_compression_id(),
            session_id: session_id.clone(),
            round,
            original_message_count: to_compress.len() as i64,
            compressed_token_count: split.compressed_tokens(),
            summary_token_count: summary_tokens,
            summary_content: summary_content.clone(),
            compressed_message_ids: to_compress.iter().map(|m| m.message_id.clone()).collect(),
            created_at: Utc::now(),
        };
        let summary_message = Message::new_summary(&session_id, &summary_content, summary_tokens, start_seq);

        debug!(
            "Round {} planned: summary {} tokens at sequence {}, ratio {:.2}",
            round,
            summary_tokens,
            start_seq,
            record.compression_ratio()
        );

        Ok(CompressionOutcome {
            compressed: to_compress.to_vec(),
            summary_message,
            record,
        })
    }

    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let prompt = build_compression_prompt(messages);
        let timeout = self.config.summary_timeout();

        let started = Instant::now();
        let response = tokio::time::timeout(timeout, self.summarizer.generate_summary(&prompt)).await;
        metrics::observe_summary_latency(started.elapsed().as_secs_f64());

        let raw = match response {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(ContextError::Summarization(e.to_string())),
            Err(_) => return Err(ContextError::SummaryTimeout(timeout.as_secs())),
        };
        validate_summary(&raw)
    }

    /// Commit a planned round. Returns the stored summary and the updated session.
    pub fn apply(&self, outcome: &CompressionOutcome) -> Result<(Message, Session)> {
        self.db
            .apply_compression(&outcome.record, outcome.summary_message.clone())
    }

    /// One full round on a session. At most one runs per session at a time;
    /// a second caller gets `CompressionInProgress` instead of waiting.
    pub async fn compress_session(&self, session_id: &str) -> Result<CompressionRecord> {
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let guard = lock
            .try_lock_owned()
            .map_err(|_| ContextError::CompressionInProgress(session_id.to_string()))?;

        let result = self.run_round(session_id).await;
        drop(guard);
        // Only the map's own handle left means nobody is waiting on this session.
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);

        if let Err(e) = &result {
            metrics::inc_compression_failure(e.kind().as_str());
            warn!("Compression failed for session {}: {}", session_id, e);
        }
        result
    }

    async fn run_round(&self, session_id: &str) -> Result<CompressionRecord> {
        info!("Starting compression for session: {}", session_id);
        if self.db.sessions.get_session(session_id)?.is_none() {
            return Err(ContextError::SessionNotFound(session_id.to_string()));
        }

        let messages = self.db.messages.get_active_messages(session_id, None)?;
        let outcome = self.compress(&messages).await?;
        let (_, session) = self.apply(&outcome)?;

        let record = outcome.record;
        metrics::inc_compression_round(record.saved_tokens());
        info!(
            "Compression completed: session={}, round={}, compressed={} messages, saved={} tokens, total now {}",
            session_id,
            record.round,
            record.original_message_count,
            record.saved_tokens(),
            session.total_token_count
        );
        Ok(record)
    }
}
