//! Training data preparation: corpus reading, next-token windows and batch collation.

use std::path::Path;

use anyhow::Context;
use candle_core::{Device, Result, Tensor};
use serde::Deserialize;

use crate::tokenizer::Tokenizer;

/// One line of a JSON-lines corpus.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CorpusLine {
    Record { content: String },
    Texts(Vec<String>),
}

/// Read every text from a JSON-lines corpus file.
///
/// See [`parse_jsonl_texts`] for the accepted line shapes.
///
/// # Errors
/// Returns an error if the file cannot be read or a line does not parse.
pub fn read_jsonl_texts(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read corpus {}", path.display()))?;
    parse_jsonl_texts(&raw).with_context(|| format!("parse corpus {}", path.display()))
}

/// Collect texts from JSON-lines input.
///
/// Each non-blank line is either an object whose `content` field holds one text
/// (other fields are ignored) or an array of texts.
///
/// # Errors
/// Returns an error naming the first line that is neither shape.
pub fn parse_jsonl_texts(raw: &str) -> anyhow::Result<Vec<String>> {
    let mut texts = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: CorpusLine = serde_json::from_str(line).with_context(|| {
            format!("line {}: expected {{\"content\": ..}} or a list of strings", idx + 1)
        })?;
        match parsed {
            CorpusLine::Record { content } => texts.push(content),
            CorpusLine::Texts(items) => texts.extend(items),
        }
    }
    Ok(texts)
}

/// Encode each text and cut it into [`sliding_windows`]; windows never span two texts.
///
/// # Errors
/// Returns an error if `window` or `stride` is zero.
pub fn windows_from_texts(
    texts: &[String],
    tokenizer: &dyn Tokenizer,
    window: usize,
    stride: usize,
) -> Result<Vec<TrainingExample>> {
    let mut examples = Vec::new();
    for text in texts {
        examples.extend(sliding_windows(&tokenizer.encode(text), window, stride)?);
    }
    Ok(examples)
}

/// One fixed-length next-token example.
///
/// `labels[i]` is the token following `input_ids[i]`; `attention_mask[i]` is 1 for
/// real tokens and 0 for padding, and is fed to the model as its padding mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingExample {
    pub input_ids: Vec<u32>,
    pub labels: Vec<u32>,
    pub attention_mask: Vec<u8>,
}

impl TrainingExample {
    /// Build a `window`-length example from the head of `tokens`, right-padding
    /// with `pad_id` when fewer than `window` tokens are available.
    ///
    /// The last real position predicts `pad_id` when the text ends inside the window.
    #[must_use]
    pub fn padded(tokens: &[u32], window: usize, pad_id: u32) -> Self {
        let real = tokens.len().min(window);
        let mut input_ids = tokens[..real].to_vec();
        input_ids.resize(window, pad_id);

        let mut labels: Vec<u32> = tokens.iter().skip(1).take(window).copied().collect();
        labels.resize(window, pad_id);

        let mut attention_mask = vec![1u8; real];
        attention_mask.resize(window, 0);

        Self {
            input_ids,
            labels,
            attention_mask,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Cut `tokens` into full windows of `window` inputs starting every `stride` tokens.
///
/// A window starting at `s` needs `tokens[s..=s + window]` (inputs plus the shifted
/// labels), so the final window always ends before the last token. Texts shorter
/// than `window + 1` tokens yield nothing.
///
/// # Errors
/// Returns an error if `window` or `stride` is zero.
pub fn sliding_windows(tokens: &[u32], window: usize, stride: usize) -> Result<Vec<TrainingExample>> {
    if window == 0 || stride == 0 {
        candle_core::bail!("window ({window}) and stride ({stride}) must be positive");
    }
    if tokens.len() <= window {
        return Ok(Vec::new());
    }

    let examples = (0..tokens.len() - window)
        .step_by(stride)
        .map(|start| TrainingExample {
            input_ids: tokens[start..start + window].to_vec(),
            labels: tokens[start + 1..=start + window].to_vec(),
            attention_mask: vec![1; window],
        })
        .collect();
    Ok(examples)
}

/// A collated batch, every tensor shaped `[batch, seq_len]`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `u32` token ids
    pub input_ids: Tensor,
    /// `u32` next-token targets
    pub labels: Tensor,
    /// `u8` validity mask
    pub attention_mask: Tensor,
}

impl Batch {
    #[must_use]
    pub fn size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// Stack equally long examples into a [`Batch`].
///
/// # Errors
/// Returns an error if `examples` is empty or the lengths differ.
pub fn collate(examples: &[TrainingExample], device: &Device) -> Result<Batch> {
    let Some(first) = examples.first() else {
        candle_core::bail!("cannot collate an empty batch");
    };
    let seq_len = first.len();
    if let Some(bad) = examples.iter().find(|e| e.len() != seq_len) {
        candle_core::bail!(
            "examples must share one length: expected {seq_len}, found {}",
            bad.len()
        );
    }

    let b = examples.len();
    let ids: Vec<u32> = examples.iter().flat_map(|e| e.input_ids.iter().copied()).collect();
    let labels: Vec<u32> = examples.iter().flat_map(|e| e.labels.iter().copied()).collect();
    let mask: Vec<u8> = examples
        .iter()
        .flat_map(|e| e.attention_mask.iter().copied())
        .collect();

    Ok(Batch {
        input_ids: Tensor::from_vec(ids, (b, seq_len), device)?,
        labels: Tensor::from_vec(labels, (b, seq_len), device)?,
        attention_mask: Tensor::from_vec(mask, (b, seq_len), device)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;

    #[test]
    fn windows_shift_labels_by_one() {
        let tokens: Vec<u32> = (0..10).collect();
        let windows = sliding_windows(&tokens, 4, 4).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].input_ids, vec![0, 1, 2, 3]);
        assert_eq!(windows[0].labels, vec![1, 2, 3, 4]);
        assert_eq!(windows[1].input_ids, vec![4, 5, 6, 7]);
        assert_eq!(windows[1].labels, vec![5, 6, 7, 8]);
        assert!(windows.iter().all(|w| w.attention_mask == vec![1; 4]));
    }

    #[test]
    fn stride_one_overlaps() {
        let tokens: Vec<u32> = (0..6).collect();
        let windows = sliding_windows(&tokens, 3, 1).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].input_ids, vec![2, 3, 4]);
        assert_eq!(windows[2].labels, vec![3, 4, 5]);
    }

    #[test]
    fn short_text_yields_nothing() {
        assert!(sliding_windows(&[1, 2, 3], 3, 1).unwrap().is_empty());
        assert!(sliding_windows(&[1, 2, 3], 0, 1).is_err());
        assert!(sliding_windows(&[1, 2, 3], 1, 0).is_err());
    }

    #[test]
    fn padded_example_masks_tail() {
        let ex = TrainingExample::padded(&[5, 6, 7], 5, 0);
        assert_eq!(ex.input_ids, vec![5, 6, 7, 0, 0]);
        assert_eq!(ex.labels, vec![6, 7, 0, 0, 0]);
        assert_eq!(ex.attention_mask, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn collate_stacks_rows() {
        let tokens: Vec<u32> = (0..9).collect();
        let windows = sliding_windows(&tokens, 4, 2).unwrap();
        let batch = collate(&windows, &Device::Cpu).unwrap();
        assert_eq!(batch.size(), 3);
        assert_eq!(batch.input_ids.dims(), &[3, 4]);
        let labels: Vec<Vec<u32>> = batch.labels.to_vec2().unwrap();
        assert_eq!(labels[1], vec![3, 4, 5, 6]);
    }

    #[test]
    fn collate_rejects_ragged_or_empty() {
        let a = TrainingExample::padded(&[1, 2], 2, 0);
        let b = TrainingExample::padded(&[1, 2], 3, 0);
        assert!(collate(&[a, b], &Device::Cpu).is_err());
        assert!(collate(&[], &Device::Cpu).is_err());
    }

    #[test]
    fn jsonl_accepts_records_and_lists() {
        let raw = "{\"title\": \"a\", \"content\": \"first poem\"}\n\n  \n[\"second\", \"third\"]\n";
        let texts = parse_jsonl_texts(raw).unwrap();
        assert_eq!(texts, vec!["first poem", "second", "third"]);
    }

    #[test]
    fn jsonl_reports_bad_line() {
        let err = parse_jsonl_texts("{\"content\": \"ok\"}\n{\"title\": 3}\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn jsonl_file_is_read() {
        let path = std::env::temp_dir().join(format!("moe-gpt-corpus-{}.jsonl", std::process::id()));
        std::fs::write(&path, "{\"content\": \"hello\"}\n").unwrap();
        let texts = read_jsonl_texts(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(texts, vec!["hello"]);
        assert!(read_jsonl_texts(&path).is_err());
    }

    #[test]
    fn windows_stay_inside_each_text() {
        let texts = vec!["abcdef".to_string(), "xy".to_string(), "uvwxyz".to_string()];
        let windows = windows_from_texts(&texts, &ByteTokenizer::new(), 4, 2).unwrap();
        // "abcdef" and "uvwxyz" give one window each; "xy" is too short.
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].input_ids, ByteTokenizer::new().encode("abcd"));
        assert_eq!(windows[1].labels, ByteTokenizer::new().encode("vwxy"));
    }
}
