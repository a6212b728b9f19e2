//! Client-side token counting for backends that do not report usage.

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::warn;

use crate::error::{LoadgenError, Result};

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Counts tokens with a HuggingFace `tokenizer.json`.
pub struct HfTokenCounter {
    tokenizer: Tokenizer,
}

impl HfTokenCounter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|err| {
            LoadgenError::Tokenizer(format!("load {}: {err}", path.display()))
        })?;
        Ok(Self { tokenizer })
    }
}

impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        // Special tokens are included to match server-side prompt accounting.
        match self.tokenizer.encode(text, true) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(err) => {
                warn!("tokenizer failed to encode text: {err}");
                0
            }
        }
    }
}
