//! Stage-aware history windows for prompt assembly
use crate::config::ContextConfig;
use crate::error::Result;
use crate::memory_db::{MemoryDatabase, Message, Role};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Share of the compression threshold a full-history injection is expected
/// to stay under once compression is keeping up.
const SIMPLE_INTERACTION_WARN_RATIO: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowStage {
    IntentRecognition,
    Planning,
    AnswerGeneration,
    /// Tool execution sees no history.
    Execution,
    /// Plain chat; gets every active message so "what did you just say"
    /// style questions can be answered.
    SimpleInteraction,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::IntentRecognition => "intent_recognition",
            WorkflowStage::Planning => "planning",
            WorkflowStage::AnswerGeneration => "answer_generation",
            WorkflowStage::Execution => "execution",
            WorkflowStage::SimpleInteraction => "simple_interaction",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ContextInjector {
    db: Arc<MemoryDatabase>,
    config: Arc<ContextConfig>,
}

impl ContextInjector {
    pub fn new(db: Arc<MemoryDatabase>, config: Arc<ContextConfig>) -> Self {
        Self { db, config }
    }

    fn turns_for(&self, stage: WorkflowStage) -> Option<usize> {
        match stage {
            WorkflowStage::IntentRecognition => Some(self.config.intent_recognition_turns),
            WorkflowStage::Planning => Some(self.config.planning_turns),
            WorkflowStage::AnswerGeneration => Some(self.config.answer_generation_turns),
            WorkflowStage::Execution => Some(self.config.execution_turns),
            WorkflowStage::SimpleInteraction => None,
        }
    }

    /// Messages to inject for `stage`, oldest first.
    pub fn inject(&self, session_id: &str, stage: WorkflowStage) -> Result<Vec<Message>> {
        let messages = match self.turns_for(stage) {
            Some(turns) => self.recent_turns(session_id, turns)?,
            None => self.all_active(session_id)?,
        };
        debug!(
            "Injected for {}: session={}, messages={}",
            stage,
            session_id,
            messages.len()
        );
        Ok(messages)
    }

    /// Latest summary (if any) followed by the last `turns` user/assistant
    /// pairs. Zero turns means no history at all.
    fn recent_turns(&self, session_id: &str, turns: usize) -> Result<Vec<Message>> {
        if turns == 0 {
            return Ok(Vec::new());
        }
        let active = self.db.messages.get_active_messages(session_id, None)?;
        let (summaries, regular): (Vec<Message>, Vec<Message>) =
            active.into_iter().partition(|m| m.role == Role::CompressionSummary);

        let keep = turns * 2;
        let skip = regular.len().saturating_sub(keep);
        let mut result = Vec::with_capacity(keep + 1);
        if let Some(summary) = summaries.into_iter().last() {
            result.push(summary);
        }
        result.extend(regular.into_iter().skip(skip));
        Ok(result)
    }

    fn all_active(&self, session_id: &str) -> Result<Vec<Message>> {
        let messages = self.db.messages.get_active_messages(session_id, None)?;
        let total = calculate_injection_tokens(&messages);
        let expected_max =
            (self.config.compression_threshold_tokens() as f64 * SIMPLE_INTERACTION_WARN_RATIO) as i64;
        if total > expected_max {
            warn!(
                "Simple interaction context for {} is {} tokens (expected < {}); compression may be falling behind",
                session_id, total, expected_max
            );
        }
        Ok(messages)
    }
}

pub fn calculate_injection_tokens(messages: &[Message]) -> i64 {
    messages.iter().map(|m| m.token_count).sum()
}

/// Render injected history as a prompt section. Empty input gives an
/// empty string.
pub fn format_messages_for_prompt(messages: &[Message]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut formatted = String::from("## Conversation history\n\n");
    for msg in messages {
        match msg.role {
            Role::CompressionSummary => {
                formatted.push_str(&format!("[Earlier conversation summary]\n{}\n\n", msg.content))
            }
            Role::User => formatted.push_str(&format!("User: {}\n\n", msg.content)),
            Role::Assistant => formatted.push_str(&format!("Assistant: {}\n\n", msg.content)),
        }
    }
    formatted.trim_end().to_string()
}
