use std::ops::Deref;
use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{PipelineError, Result};

/// Text to token ids and back.
pub trait TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

// The two-argument `encode`/`decode` live on the `TokenizerImpl` behind `Deref`.
impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = Deref::deref(self)
            .encode(text, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Deref::deref(self)
            .decode(ids, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))
    }
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| PipelineError::Tokenizer(e.to_string()))
}
