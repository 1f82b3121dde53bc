//! Text encoding and decoding.
//!
//! Tokenization is owned by the model, so the scheduler only sees it
//! through [`TextCodec`]. An implementation for HuggingFace tokenizers is
//! provided.

use tokenizers::Tokenizer;

use crate::error::{Error, Result};

/// Special tokens commonly used as end-of-sequence markers.
const EOS_CANDIDATES: [&str; 4] = ["<|endoftext|>", "</s>", "<|im_end|>", "<|eot_id|>"];

/// Converts between text and token ids.
pub trait TextCodec: Send + Sync {
    /// Encode a prompt.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode generated tokens, skipping special tokens.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    /// Tokens that end generation.
    fn eos_token_ids(&self) -> Vec<u32>;
}

impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self).encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        (**self).decode(token_ids, true).map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eos_token_ids(&self) -> Vec<u32> {
        EOS_CANDIDATES
            .iter()
            .filter_map(|token| self.token_to_id(token))
            .collect()
    }
}
