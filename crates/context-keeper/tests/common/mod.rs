#![allow(dead_code)]

use async_trait::async_trait;
use context_keeper::{ContextConfig, MemoryDatabase, SessionManager, Summarizer, TokenCounter};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const VALID_SUMMARY: &str = "<conversation_summary> <topic>t</topic> <key_points>p</key_points> \
     <decisions>d</decisions> <context>c</context> </conversation_summary>";

/// One token per whitespace-separated word.
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count_tokens(&self, text: &str, _model_id: &str) -> usize {
        text.split_whitespace().count()
    }
}

pub fn words(n: usize) -> String {
    vec!["w"; n].join(" ")
}

pub enum Reply {
    Text(String),
    Fail(String),
    Hang(Duration),
}

/// Plays back queued replies in order; a valid summary once the queue is empty.
#[derive(Default)]
pub struct ScriptedSummarizer {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
}

impl ScriptedSummarizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn generate_summary(&self, _prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            None => Ok(VALID_SUMMARY.to_string()),
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(msg)) => Err(anyhow::anyhow!(msg)),
            Some(Reply::Hang(d)) => {
                tokio::time::sleep(d).await;
                Ok(VALID_SUMMARY.to_string())
            }
        }
    }
}

pub fn test_config(max_context_tokens: i64) -> ContextConfig {
    ContextConfig {
        max_context_tokens,
        compression_threshold_ratio: 0.8,
        compression_preserve_ratio: 0.3,
        summary_timeout_seconds: 2,
        ..ContextConfig::default()
    }
}

pub fn manager(
    db: Arc<MemoryDatabase>,
    summarizer: Arc<ScriptedSummarizer>,
    config: ContextConfig,
) -> SessionManager {
    SessionManager::new(db, summarizer, Arc::new(WordCounter), Arc::new(config))
}

pub fn in_memory(summarizer: Arc<ScriptedSummarizer>, max_context_tokens: i64) -> SessionManager {
    let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
    manager(db, summarizer, test_config(max_context_tokens))
}

/// The counter must always agree with the message log.
pub fn assert_token_invariant(manager: &SessionManager, session_id: &str) {
    let session = manager.load_session(session_id).unwrap().unwrap();
    let actual = manager.calculate_session_tokens(session_id).unwrap();
    assert_eq!(
        session.total_token_count, actual,
        "cached total drifted from active messages"
    );
}
