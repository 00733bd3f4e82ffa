//! Token counting for node `tokens` estimates and context-budget trimming.

use std::sync::Arc;

use anyhow::Result;

/// Counts and truncates text by token.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
    fn truncate(&self, text: &str, max_tokens: usize) -> String;
}

/// `cl100k_base`-backed tokenizer.
pub struct TiktokenTokenizer {
    bpe: Arc<tiktoken_rs::CoreBPE>,
}

impl TiktokenTokenizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bpe: Arc::new(tiktoken_rs::cl100k_base()?),
        })
    }
}

impl Default for TiktokenTokenizer {
    fn default() -> Self {
        Self::new().expect("cl100k_base encoding is bundled and always loads")
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        self.bpe
            .decode(tokens[..max_tokens].to_vec())
            .unwrap_or_default()
    }
}

/// Character/4 heuristic, used in tests and as a zero-dependency fallback.
/// Matches `len(response)//4` from the turn-response token estimate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleTokenizer;

impl Tokenizer for SimpleTokenizer {
    fn count(&self, text: &str) -> usize {
        (text.len() + 3) / 4
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let max_chars = max_tokens * 4;
        if text.len() <= max_chars {
            return text.to_string();
        }
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_tokenizer_matches_len_over_four_heuristic() {
        let t = SimpleTokenizer;
        assert_eq!(t.count("abcd"), 1);
        assert_eq!(t.count("abcdefgh"), 2);
    }

    #[test]
    fn tiktoken_round_trips_short_text() {
        let t = TiktokenTokenizer::new().unwrap();
        let count = t.count("hello, world!");
        assert!(count > 0);
    }
}
