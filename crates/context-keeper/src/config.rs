// context-keeper/crates/context-keeper/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ContextError;

/// Upper bound on a single summarization call.
pub const MAX_SUMMARY_TIMEOUT_SECONDS: u64 = 3600;

/// Runtime configuration for the context subsystem.
///
/// Built once at startup and shared as `Arc<ContextConfig>` with the session
/// manager, compression engine and injector.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub database_path: PathBuf,
    pub model_name: String,
    pub max_context_tokens: i64,
    pub compression_threshold_ratio: f64,
    pub compression_preserve_ratio: f64,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub summary_max_tokens: u32,
    pub summary_temperature: f32,
    pub summary_timeout_seconds: u64,
    pub intent_recognition_turns: usize,
    pub planning_turns: usize,
    pub answer_generation_turns: usize,
    pub execution_turns: usize,
    pub heuristic_chars_per_token: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/context.db"),
            model_name: "gpt-4o-mini".to_string(),
            max_context_tokens: 128_000,
            compression_threshold_ratio: 0.8,
            compression_preserve_ratio: 0.3,
            llm_base_url: "http://127.0.0.1:8081".to_string(),
            llm_api_key: None,
            summary_max_tokens: 2048,
            summary_temperature: 0.3,
            summary_timeout_seconds: 120,
            intent_recognition_turns: 2,
            planning_turns: 2,
            answer_generation_turns: 3,
            execution_turns: 0,
            heuristic_chars_per_token: 1,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl ContextConfig {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded ({}), using process environment", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let config = Self {
            database_path: env::var("CONTEXT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            model_name: env::var("MODEL_NAME").unwrap_or(defaults.model_name),
            max_context_tokens: env_or("MAX_CONTEXT_TOKENS", defaults.max_context_tokens)?,
            compression_threshold_ratio: env_or(
                "COMPRESSION_THRESHOLD_RATIO",
                defaults.compression_threshold_ratio,
            )?,
            compression_preserve_ratio: env_or(
                "COMPRESSION_PRESERVE_RATIO",
                defaults.compression_preserve_ratio,
            )?,
            llm_base_url: env::var("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_api_key: env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            summary_max_tokens: env_or("SUMMARY_MAX_TOKENS", defaults.summary_max_tokens)?,
            summary_temperature: env_or("SUMMARY_TEMPERATURE", defaults.summary_temperature)?,
            summary_timeout_seconds: env_or(
                "SUMMARY_TIMEOUT_SECONDS",
                defaults.summary_timeout_seconds,
            )?,
            intent_recognition_turns: env_or(
                "INTENT_RECOGNITION_TURNS",
                defaults.intent_recognition_turns,
            )?,
            planning_turns: env_or("PLANNING_TURNS", defaults.planning_turns)?,
            answer_generation_turns: env_or(
                "ANSWER_GENERATION_TURNS",
                defaults.answer_generation_turns,
            )?,
            execution_turns: env_or("EXECUTION_TURNS", defaults.execution_turns)?,
            heuristic_chars_per_token: env_or(
                "HEURISTIC_CHARS_PER_TOKEN",
                defaults.heuristic_chars_per_token,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Absolute token count above which a session gets compressed.
    pub fn compression_threshold_tokens(&self) -> i64 {
        (self.max_context_tokens as f64 * self.compression_threshold_ratio).floor() as i64
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_seconds)
    }

    pub fn validate(&self) -> std::result::Result<(), ContextError> {
        if self.max_context_tokens <= 0 {
            return Err(ContextError::InvalidConfig(
                "max_context_tokens must be positive".to_string(),
            ));
        }
        if !(self.compression_threshold_ratio > 0.0 && self.compression_threshold_ratio <= 1.0) {
            return Err(ContextError::InvalidConfig(format!(
                "compression_threshold_ratio must be in (0, 1], got {}",
                self.compression_threshold_ratio
            )));
        }
        if !(self.compression_preserve_ratio >= 0.0 && self.compression_preserve_ratio < 1.0) {
            return Err(ContextError::InvalidConfig(format!(
                "compression_preserve_ratio must be in [0, 1), got {}",
                self.compression_preserve_ratio
            )));
        }
        if self.summary_timeout_seconds == 0 || self.summary_timeout_seconds > MAX_SUMMARY_TIMEOUT_SECONDS {
            return Err(ContextError::InvalidConfig(format!(
                "summary_timeout_seconds must be in [1, {}], got {}",
                MAX_SUMMARY_TIMEOUT_SECONDS, self.summary_timeout_seconds
            )));
        }
        if self.heuristic_chars_per_token == 0 {
            return Err(ContextError::InvalidConfig(
                "heuristic_chars_per_token must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_path.display());
        info!("- Model: {}", self.model_name);
        info!("- Max Context Tokens: {}", self.max_context_tokens);
        info!(
            "- Compression Threshold: {} ({:.0}%)",
            self.compression_threshold_tokens(),
            self.compression_threshold_ratio * 100.0
        );
        info!("- Preserve Ratio: {:.0}%", self.compression_preserve_ratio * 100.0);
        info!("- LLM Backend: {}", self.llm_base_url);
        info!("- Summary Timeout: {}s", self.summary_timeout_seconds);
        info!(
            "- Injection Turns: intent={}, planning={}, answer={}, execution={}",
            self.intent_recognition_turns,
            self.planning_turns,
            self.answer_generation_turns,
            self.execution_turns
        );
    }
}
