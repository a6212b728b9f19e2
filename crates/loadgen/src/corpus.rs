//! Prompt corpus loading and sizing.

use std::path::Path;

use tracing::debug;

use crate::config::BenchConfig;
use crate::error::{LoadgenError, Result};

/// A formatted prompt and its position in the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub index: usize,
    pub text: String,
}

impl Prompt {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }

    /// Length in characters, as reported in request outcomes.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Read column `col_idx` of every record in a CSV file.
pub fn read_corpus(path: &Path, col_idx: usize, skip_header: bool) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(skip_header)
        .flexible(true)
        .from_path(path)?;

    let mut prompts = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let field = record
            .get(col_idx)
            .ok_or(LoadgenError::MissingColumn { row, col_idx })?;
        prompts.push(field.to_string());
    }

    debug!(path = %path.display(), prompts = prompts.len(), "loaded prompt corpus");
    Ok(prompts)
}

/// Resize the corpus to `prompt_num` entries.
///
/// Zero keeps the corpus as is, a smaller count truncates, and a larger one
/// repeats the whole corpus, which is only possible for exact multiples.
pub fn adjust_prompt_count(prompts: Vec<String>, prompt_num: usize) -> Result<Vec<String>> {
    if prompt_num == 0 {
        return Ok(prompts);
    }
    if prompts.is_empty() {
        return Err(LoadgenError::EmptyCorpus);
    }
    if prompt_num <= prompts.len() {
        let mut prompts = prompts;
        prompts.truncate(prompt_num);
        return Ok(prompts);
    }

    let repeat = prompt_num / prompts.len();
    if repeat * prompts.len() != prompt_num {
        return Err(LoadgenError::CorpusLength {
            available: prompts.len(),
            requested: prompt_num,
        });
    }
    Ok(std::iter::repeat(prompts).take(repeat).flatten().collect())
}

/// Read, resize and template the configured corpus.
pub fn load_prompts(config: &BenchConfig) -> Result<Vec<Prompt>> {
    let corpus = &config.corpus;
    let raw = read_corpus(&corpus.input_csv, corpus.col_idx, corpus.skip_header)?;
    let raw = adjust_prompt_count(raw, corpus.prompt_num)?;
    if raw.is_empty() {
        return Err(LoadgenError::EmptyCorpus);
    }
    Ok(config.effective_model_type().format_corpus(&raw))
}
