//! Token vocabulary shared by the dataset pipeline and the decoding helpers.
//!
//! The vocabulary is a flat JSON array of token strings. Index 0 is reserved
//! for padding and must hold [`PAD_TOKEN`]; the start, end and unknown markers
//! must also be present. Token id 0 therefore never appears as legitimate
//! content in an encoded sequence.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

pub const PAD_ID: i64 = 0;
pub const PAD_TOKEN: &str = "<pad>";
pub const START_TOKEN: &str = "<s>";
pub const END_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";

pub type Result<T> = std::result::Result<T, VocabError>;

#[derive(Error, Debug)]
pub enum VocabError {
    #[error("failed to read vocabulary file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse vocabulary file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid vocabulary: {0}")]
    Invalid(String),

    #[error("token id {0} is out of range for vocabulary of size {1}")]
    OutOfRange(i64, usize),
}

/// Bidirectional token <-> id mapping with reserved special tokens.
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, i64>,
    start_idx: i64,
    end_idx: i64,
    unk_idx: i64,
}

impl Vocabulary {
    /// Loads a vocabulary from a JSON array of token strings.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let tokens: Vec<String> = serde_json::from_str(&contents)?;
        Self::from_tokens(tokens)
    }

    pub fn from_tokens(tokens: Vec<String>) -> Result<Self> {
        if tokens.is_empty() {
            return Err(VocabError::Invalid("vocabulary is empty".into()));
        }
        if tokens[0] != PAD_TOKEN {
            return Err(VocabError::Invalid(format!(
                "token id 0 must be the padding marker '{}', found '{}'",
                PAD_TOKEN, tokens[0]
            )));
        }

        let mut index = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            if index.insert(token.clone(), id as i64).is_some() {
                return Err(VocabError::Invalid(format!(
                    "duplicate token '{}' in vocabulary",
                    token
                )));
            }
        }

        let lookup = |token: &str| {
            index.get(token).copied().ok_or_else(|| {
                VocabError::Invalid(format!("vocabulary is missing required token '{}'", token))
            })
        };
        let start_idx = lookup(START_TOKEN)?;
        let end_idx = lookup(END_TOKEN)?;
        let unk_idx = lookup(UNK_TOKEN)?;

        Ok(Self {
            tokens,
            index,
            start_idx,
            end_idx,
            unk_idx,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn start_idx(&self) -> i64 {
        self.start_idx
    }

    pub fn end_idx(&self) -> i64 {
        self.end_idx
    }

    /// Looks up a single token, falling back to the unknown marker.
    pub fn token_to_id(&self, token: &str) -> i64 {
        self.index.get(token).copied().unwrap_or(self.unk_idx)
    }

    /// Encodes whitespace-separated text into token ids.
    pub fn encode(&self, text: &str, include_start: bool, include_end: bool) -> Vec<i64> {
        let mut ids = Vec::new();
        if include_start {
            ids.push(self.start_idx);
        }
        for token in text.split_whitespace() {
            ids.push(self.token_to_id(token));
        }
        if include_end {
            ids.push(self.end_idx);
        }
        ids
    }

    /// Decodes token ids back into text, dropping padding and the
    /// start/end markers.
    pub fn decode(&self, ids: &[i64]) -> Result<String> {
        let mut words = Vec::with_capacity(ids.len());
        for &id in ids {
            if id == PAD_ID || id == self.start_idx || id == self.end_idx {
                continue;
            }
            let idx = usize::try_from(id)
                .map_err(|_| VocabError::OutOfRange(id, self.tokens.len()))?;
            let token = self
                .tokens
                .get(idx)
                .ok_or(VocabError::OutOfRange(id, self.tokens.len()))?;
            words.push(token.as_str());
        }
        Ok(words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_vocab() -> Vocabulary {
        let tokens = [PAD_TOKEN, START_TOKEN, END_TOKEN, UNK_TOKEN, "~", "en", "hund", "springer"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        Vocabulary::from_tokens(tokens).unwrap()
    }

    #[test]
    fn reserves_id_zero_for_padding() {
        let vocab = small_vocab();
        assert_eq!(vocab.token_to_id(PAD_TOKEN), PAD_ID);
        assert!(vocab.start_idx() != PAD_ID);
        assert!(vocab.end_idx() != PAD_ID);
    }

    #[test]
    fn rejects_vocab_without_padding_slot() {
        let tokens = vec![START_TOKEN.to_string(), END_TOKEN.to_string()];
        assert!(Vocabulary::from_tokens(tokens).is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let vocab = small_vocab();
        let text = "en hund springer";
        let ids = vocab.encode(text, true, true);
        assert_eq!(ids[0], vocab.start_idx());
        assert_eq!(*ids.last().unwrap(), vocab.end_idx());
        assert_eq!(vocab.decode(&ids).unwrap(), text);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let vocab = small_vocab();
        let ids = vocab.encode("en katt", false, false);
        assert_eq!(ids[0], vocab.token_to_id("en"));
        assert_eq!(ids[1], vocab.token_to_id(UNK_TOKEN));
    }

    #[test]
    fn decode_rejects_out_of_range_ids() {
        let vocab = small_vocab();
        assert!(vocab.decode(&[9999]).is_err());
    }
}
