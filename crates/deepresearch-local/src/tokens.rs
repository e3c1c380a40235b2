//! Token accounting for context budgets.

use crate::{Conversation, Error, Result, TokenEstimator};
use std::sync::Arc;

/// Chat templates add a few framing tokens around every message.
const PER_MESSAGE_OVERHEAD: usize = 4;
const PER_CONVERSATION_OVERHEAD: usize = 3;

/// cl100k BPE tokenizer.
pub struct Tokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").finish_non_exhaustive()
    }
}

impl Tokenizer {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| Error::NotConfigured(e.to_string()))?;
        Ok(Self { bpe })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Keep at most `max_tokens` tokens of `text`.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        match self.bpe.decode(tokens[..max_tokens].to_vec()) {
            Ok(s) => s,
            // A cut through a multi-byte sequence can fail to decode; fall back to chars.
            Err(_) => text.chars().take(max_tokens.saturating_mul(4)).collect(),
        }
    }
}

impl TokenEstimator for Tokenizer {
    fn estimate(&self, conversation: &Conversation) -> usize {
        conversation
            .messages()
            .iter()
            .map(|m| self.count(m.role.as_str()) + self.count(&m.content) + PER_MESSAGE_OVERHEAD)
            .sum::<usize>()
            + PER_CONVERSATION_OVERHEAD
    }
}

/// Bytes / 4. Used when the BPE tables cannot be loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteEstimator;

impl TokenEstimator for ByteEstimator {
    fn estimate(&self, conversation: &Conversation) -> usize {
        conversation
            .messages()
            .iter()
            .map(|m| m.content.len().div_ceil(4) + PER_MESSAGE_OVERHEAD)
            .sum::<usize>()
            + PER_CONVERSATION_OVERHEAD
    }
}

/// The cl100k estimator, or [`ByteEstimator`] if it fails to initialise.
pub fn default_estimator() -> Arc<dyn TokenEstimator> {
    match Tokenizer::new() {
        Ok(t) => Arc::new(t),
        Err(e) => {
            tracing::warn!(error = %e, "tokenizer unavailable; using byte estimate");
            Arc::new(ByteEstimator)
        }
    }
}
