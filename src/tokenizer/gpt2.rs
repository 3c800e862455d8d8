//! GPT-2 byte-pair encoding (the 50257-token `r50k_base` vocabulary).
//!
//! Matches the vocabulary of the `gpt-124m` and `tunx` presets. `<|endoftext|>` is
//! encoded as its special id 50256.

use anyhow::Context;
use tiktoken_rs::CoreBPE;

use super::Tokenizer;

/// Vocabulary size: 50256 merges plus `<|endoftext|>`.
pub const VOCAB_SIZE: usize = 50257;

/// Id of `<|endoftext|>`.
pub const END_OF_TEXT: u32 = 50256;

/// GPT-2 BPE tokenizer.
pub struct Gpt2Tokenizer {
    bpe: CoreBPE,
}

impl Gpt2Tokenizer {
    /// Build the tokenizer from the bundled merge table.
    ///
    /// # Errors
    /// Returns an error if the merge table fails to parse.
    pub fn new() -> anyhow::Result<Self> {
        let bpe = tiktoken_rs::r50k_base().context("Failed to load the GPT-2 merge table")?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for Gpt2Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }

    /// Ids outside the vocabulary are dropped; a token boundary that splits a
    /// UTF-8 sequence decodes to U+FFFD.
    #[allow(clippy::used_underscore_items)]
    fn decode(&self, ids: &[u32]) -> String {
        let known: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|&id| (id as usize) < VOCAB_SIZE)
            .collect();
        let bytes: Vec<u8> = self.bpe._decode_native_and_split(known).flatten().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_gpt2_ids() {
        let tok = Gpt2Tokenizer::new().unwrap();
        assert_eq!(tok.encode("Hello world"), vec![15496, 995]);
        assert_eq!(tok.encode("Every effort moves you"), vec![6109, 3626, 6100, 345]);
        assert_eq!(tok.encode("<|endoftext|>"), vec![END_OF_TEXT]);
    }

    #[test]
    fn test_roundtrip() {
        let tok = Gpt2Tokenizer::new().unwrap();
        for text in ["Every effort moves you", "naïve café ✓", "  spaced\n\ttext<|endoftext|>"] {
            assert_eq!(tok.decode(&tok.encode(text)), text);
        }
    }

    #[test]
    fn test_out_of_range_ids_dropped() {
        let tok = Gpt2Tokenizer::new().unwrap();
        assert_eq!(tok.decode(&[15496, 60_000, 995]), "Hello world");
    }

    #[test]
    fn test_ids_fit_vocab() {
        let tok = Gpt2Tokenizer::new().unwrap();
        let ids = tok.encode("The quick brown fox <|endoftext|> jumps");
        assert!(ids.iter().all(|&id| (id as usize) < tok.vocab_size()));
    }
}
