//! The summarization backend seen from the compression engine
use async_trait::async_trait;

/// Produces text for a prompt. May fail or hang; the engine bounds the call
/// with a timeout and validates whatever comes back.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn generate_summary(&self, prompt: &str) -> anyhow::Result<String>;
}
