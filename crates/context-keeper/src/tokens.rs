//! Token accounting
//!
//! Token counts are computed once per message at creation time and never
//! recomputed, so the counter only needs to be deterministic for a given
//! `(text, model_id)` pair. Counting never fails: when no tokenizer can be
//! loaded the count degrades to a character-based upper bound.

use dashmap::DashMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str, model_id: &str) -> usize;
}

/// `ceil(chars / chars_per_token)`. With the default of one character per
/// token this over-counts every real tokenizer.
#[derive(Debug, Clone)]
pub struct HeuristicCounter {
    chars_per_token: usize,
}

impl HeuristicCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self { chars_per_token: chars_per_token.max(1) }
    }
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TokenCounter for HeuristicCounter {
    fn count_tokens(&self, text: &str, _model_id: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token)
    }
}

/// BPE counter backed by `tiktoken-rs`, one encoder per model id.
pub struct TiktokenCounter {
    encoders: DashMap<String, Option<Arc<CoreBPE>>>,
    fallback: HeuristicCounter,
}

impl TiktokenCounter {
    pub fn new(fallback: HeuristicCounter) -> Self {
        Self {
            encoders: DashMap::new(),
            fallback,
        }
    }

    fn encoder(&self, model_id: &str) -> Option<Arc<CoreBPE>> {
        if let Some(entry) = self.encoders.get(model_id) {
            return entry.clone();
        }

        let loaded = match tiktoken_rs::get_bpe_from_model(model_id) {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(_) => {
                debug!("No dedicated tokenizer for model {}, using cl100k_base", model_id);
                match tiktoken_rs::cl100k_base() {
                    Ok(bpe) => Some(Arc::new(bpe)),
                    Err(e) => {
                        warn!(
                            "Tokenizer unavailable for model {} ({}), falling back to character estimate",
                            model_id, e
                        );
                        None
                    }
                }
            }
        };

        self.encoders
            .entry(model_id.to_string())
            .or_insert(loaded)
            .clone()
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new(HeuristicCounter::default())
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str, model_id: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder(model_id) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => self.fallback.count_tokens(text, model_id),
        }
    }
}
