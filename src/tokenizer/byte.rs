//! Byte-level tokenizer: one id per UTF-8 byte.
//!
//! Every string is representable, so encode/decode round-trips losslessly for all
//! text. Ids outside `0..256` (a model with a larger vocabulary can emit them) are
//! dropped on decode, and invalid UTF-8 is replaced rather than rejected.

use super::Tokenizer;

/// Vocabulary size: every byte value.
pub const VOCAB_SIZE: usize = 256;

/// Stateless byte tokenizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}
