use thiserror::Error;

/// Errors that abort a benchmark campaign.
///
/// Per-request failures never surface here: they are retried inside the
/// executor and, once the retry budget is spent, reported as
/// [`RequestResult::Failed`](crate::executor::RequestResult).
#[derive(Debug, Error)]
pub enum LoadgenError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(
        "cannot expand {available} prompts to {requested}: requested count must be an integer multiple of the corpus size"
    )]
    CorpusLength { available: usize, requested: usize },
    #[error("prompt corpus is empty")]
    EmptyCorpus,
    #[error("corpus row {row} has no column {col_idx}")]
    MissingColumn { row: usize, col_idx: usize },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LoadgenError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        LoadgenError::Config(msg.into())
    }
}

impl From<::config::ConfigError> for LoadgenError {
    fn from(err: ::config::ConfigError) -> Self {
        LoadgenError::Config(err.to_string())
    }
}

pub type Result<T, E = LoadgenError> = std::result::Result<T, E>;
