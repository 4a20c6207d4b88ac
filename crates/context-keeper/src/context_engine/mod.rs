//! Context engine: split selection, summarization, compression rounds,
//! session orchestration and stage-based history injection

pub mod compression_engine;
pub mod injector;
pub mod prompt;
pub mod session_manager;
pub mod split;
pub mod summarizer;

pub use compression_engine::{CompressionEngine, CompressionOutcome};
pub use injector::{calculate_injection_tokens, format_messages_for_prompt, ContextInjector, WorkflowStage};
pub use session_manager::{SessionBudget, SessionManager};
pub use split::{find_split_point, SplitPoint};
pub use summarizer::Summarizer;
