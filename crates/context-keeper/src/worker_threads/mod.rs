//! Workers that talk to external backends

pub mod llm_worker;

pub use llm_worker::LLMWorker;
