//! Tokenizers turning text into model ids and back.

pub mod byte;
pub mod gpt2;

pub use byte::ByteTokenizer;
pub use gpt2::Gpt2Tokenizer;

/// Text <-> id mapping used by data preparation and generation.
///
/// `decode(encode(text)) == text` must hold for any text the vocabulary can represent.
pub trait Tokenizer {
    /// Encode text into token ids.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token ids back into text.
    fn decode(&self, ids: &[u32]) -> String;

    /// Number of distinct ids `encode` can produce.
    fn vocab_size(&self) -> usize;
}

/// Pick the tokenizer whose ids cover a model with `vocab_size` outputs.
///
/// Byte-level for vocabularies up to 256 ids, GPT-2 BPE for exactly 50257.
///
/// # Errors
/// Returns an error for any other vocabulary size, since generated ids could not
/// all be decoded.
pub fn for_vocab_size(vocab_size: usize) -> anyhow::Result<Box<dyn Tokenizer>> {
    match vocab_size {
        0 => anyhow::bail!("vocabulary size must be positive"),
        v if v <= byte::VOCAB_SIZE => Ok(Box::new(ByteTokenizer::new())),
        gpt2::VOCAB_SIZE => Ok(Box::new(Gpt2Tokenizer::new()?)),
        v => anyhow::bail!(
            "no tokenizer covers a vocabulary of {v} ids (supported: <= {}, {})",
            byte::VOCAB_SIZE,
            gpt2::VOCAB_SIZE
        ),
    }
}
