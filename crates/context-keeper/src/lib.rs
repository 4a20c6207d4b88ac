// context-keeper/crates/context-keeper/src/lib.rs

pub mod config;
pub mod context_engine;
pub mod error;
pub mod memory_db;
pub mod metrics;
pub mod telemetry;
pub mod tokens;
pub mod utils;
pub mod worker_threads;

// Public API exports
pub use config::ContextConfig;
pub use context_engine::{
    CompressionEngine, CompressionOutcome, ContextInjector, SessionBudget, SessionManager, Summarizer,
    WorkflowStage,
};
pub use error::{ContextError, ErrorKind, Result};
pub use memory_db::{CompressionRecord, DatabaseStats, MemoryDatabase, Message, Role, Session};
pub use tokens::{HeuristicCounter, TiktokenCounter, TokenCounter};
pub use worker_threads::LLMWorker;
