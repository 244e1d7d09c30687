//! Tokenizer seam.
//!
//! The engine treats tokenization as an external collaborator: anything
//! that encodes text to ids, decodes ids to text, and names its special
//! tokens plugs in. A byte-level reference tokenizer ships for tests and
//! smoke runs.

use std::sync::Arc;

/// Special token ids a model relies on. Only `eos` is mandatory.
#[derive(Debug, Clone, Copy)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: u32,
    pub pad: Option<u32>,
}

/// Opaque text codec the pipeline drives.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, ids: &[u32]) -> String;
    fn special_tokens(&self) -> SpecialTokens;
}

impl Tokenizer for Arc<dyn Tokenizer> {
    fn encode(&self, text: &str) -> Vec<u32> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[u32]) -> String {
        (**self).decode(ids)
    }

    fn special_tokens(&self) -> SpecialTokens {
        (**self).special_tokens()
    }
}

/// Byte-level tokenizer: id 0 is eos, id 1 is bos, byte `b` maps to
/// `b + 2`. Vocabulary size 258.
#[derive(Debug, Default, Clone)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    /// Ids this tokenizer can produce.
    pub const VOCAB_SIZE: usize = 258;

    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(|b| b as u32 + 2).collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| (id >= 2 && id < 258).then(|| (id - 2) as u8))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: Some(1),
            eos: 0,
            pad: None,
        }
    }
}
