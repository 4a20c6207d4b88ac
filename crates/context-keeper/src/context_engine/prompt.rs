//! Summarization prompt and checks on what comes back
use crate::error::{ContextError, Result};
use crate::memory_db::{Message, Role};
use crate::utils::text_utils::truncate_with_ellipsis;
use lazy_static::lazy_static;
use regex::Regex;

const SUMMARY_INSTRUCTIONS: &str = "You are a conversation summarization assistant. Condense the \
conversation between a user and an AI assistant below into a structured XML summary.

Requirements:
1. Keep the key information: topics discussed, conclusions reached, the user's decisions and preferences.
2. Keep chronological order.
3. Be concise but complete: drop repetition, never drop facts needed to continue the conversation.
4. Use exactly the XML layout below.

Output format:
<conversation_summary>
  <topic>One-line description of the main topic</topic>
  <key_points>
    <point>Key point with concrete details</point>
  </key_points>
  <decisions>Decisions, preferences or conclusions the user arrived at</decisions>
  <context>Other context worth keeping: user background, constraints, open questions</context>
</conversation_summary>

If a section has nothing to say, keep its tags and write \"none\". Do not add commentary outside the XML.";

/// Sections a summary must contain, in order.
pub const REQUIRED_SECTIONS: [&str; 4] = ["topic", "key_points", "decisions", "context"];

lazy_static! {
    static ref SUMMARY_BLOCK: Regex =
        Regex::new(r"(?s)<conversation_summary>.*?</conversation_summary>").unwrap();
}

/// Instructions followed by the span, rendered turn by turn. Earlier
/// summaries in the span are passed on as such so their content survives.
pub fn build_compression_prompt(messages: &[Message]) -> String {
    let mut conversation = String::from("## Conversation to summarize\n\n");
    let mut turn = 1;
    for msg in messages {
        match msg.role {
            Role::CompressionSummary => {
                conversation.push_str("### Summary of earlier conversation\n\n");
                conversation.push_str(&msg.content);
                conversation.push_str("\n\n");
            }
            Role::User => {
                conversation.push_str(&format!("### Turn {}\n\n**User**: {}\n\n", turn, msg.content));
            }
            Role::Assistant => {
                conversation.push_str(&format!("**Assistant**: {}\n\n", msg.content));
                turn += 1;
            }
        }
    }

    format!(
        "{}\n\n{}\nSummarize the conversation above as XML in the required format.",
        SUMMARY_INSTRUCTIONS, conversation
    )
}

/// The first `<conversation_summary>` block in `output`, without whatever
/// the model wrapped around it.
pub fn extract_summary_content(output: &str) -> Option<&str> {
    SUMMARY_BLOCK.find(output).map(|m| m.as_str())
}

/// Pull the summary block out of a raw model response and check that every
/// required section is present, opened and closed, in order.
pub fn validate_summary(output: &str) -> Result<String> {
    let block = extract_summary_content(output).ok_or_else(|| {
        ContextError::MalformedSummary(format!(
            "no <conversation_summary> block in: {}",
            truncate_with_ellipsis(output, 100)
        ))
    })?;

    let mut cursor = 0;
    for section in REQUIRED_SECTIONS {
        let open = format!("<{}>", section);
        let close = format!("</{}>", section);
        let start = block[cursor..]
            .find(&open)
            .map(|i| cursor + i)
            .ok_or_else(|| ContextError::MalformedSummary(format!("missing or misplaced <{}>", section)))?;
        let end = block[start..]
            .find(&close)
            .map(|i| start + i)
            .ok_or_else(|| ContextError::MalformedSummary(format!("unclosed <{}>", section)))?;
        cursor = end + close.len();
    }

    Ok(block.to_string())
}
