//! One prompt, one HTTP exchange, retried until it yields a usable answer.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{BackendCodec, Generation, MalformedResponse, PayloadScope};
use crate::config::{BenchConfig, RetryLimit, SamplingConfig};
use crate::corpus::Prompt;
use crate::error::Result;
use crate::recorder::{LatencyRecorder, Progress, RequestOutcome};
use crate::tokens::{HfTokenCounter, TokenCounter};

const CLIENT_NAME: &str = "Benchmark Client";

/// Final state of one request after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestResult {
    Completed(String),
    Failed { attempts: u32, last_error: String },
}

impl RequestResult {
    pub fn text(&self) -> Option<&str> {
        match self {
            RequestResult::Completed(text) => Some(text),
            RequestResult::Failed { .. } => None,
        }
    }
}

/// Why a single attempt has to be repeated.
#[derive(Debug, Error)]
enum AttemptError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error(transparent)]
    Malformed(#[from] MalformedResponse),
    #[error("endpoint reported error: {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub stream: bool,
    pub timeout: Duration,
    pub retry_limit: RetryLimit,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            stream: false,
            timeout: Duration::from_secs(30 * 3600),
            retry_limit: RetryLimit::default(),
        }
    }
}

/// Arrival times of non-empty stream chunks relative to request start.
#[derive(Debug)]
struct StreamTiming {
    started: Instant,
    previous: Instant,
    first_token: Option<Duration>,
    inter_token: Vec<Duration>,
}

impl StreamTiming {
    fn new(started: Instant) -> Self {
        Self {
            started,
            previous: started,
            first_token: None,
            inter_token: Vec::new(),
        }
    }

    fn observe(&mut self, now: Instant) {
        match self.first_token {
            None => self.first_token = Some(now - self.started),
            Some(_) => self.inter_token.push(now - self.previous),
        }
        self.previous = now;
    }
}

struct Exchange {
    generation: Generation,
    first_token: Duration,
    inter_token: Vec<Duration>,
}

pub struct RequestExecutor {
    client: reqwest::Client,
    url: String,
    codec: Arc<dyn BackendCodec>,
    sampling: SamplingConfig,
    options: ExecutorOptions,
    tokens: Option<Arc<dyn TokenCounter>>,
}

impl RequestExecutor {
    pub fn new(
        url: impl Into<String>,
        codec: Arc<dyn BackendCodec>,
        sampling: SamplingConfig,
        options: ExecutorOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            codec,
            sampling,
            options,
            tokens: None,
        })
    }

    /// Build the executor for the configured endpoint, loading a tokenizer
    /// when the backend does not report token counts.
    pub fn from_config(config: &BenchConfig) -> Result<Self> {
        let codec = config.endpoint.backend.codec();
        let url = config.endpoint.url(codec.endpoint_path());
        let sampling = SamplingConfig {
            stop_token_ids: config.stop_token_ids(),
            ..config.sampling.clone()
        };
        let options = ExecutorOptions {
            stream: config.load.stream,
            timeout: config.endpoint.timeout(),
            retry_limit: config.endpoint.max_retries,
        };
        let executor = Self::new(url, codec, sampling, options)?;

        let needs_tokenizer = config.endpoint.backend.needs_client_tokenizer();
        match (&config.endpoint.tokenizer_path, needs_tokenizer) {
            (Some(path), true) => {
                let counter = HfTokenCounter::from_file(path)?;
                Ok(executor.with_token_counter(Arc::new(counter)))
            }
            (None, true) => {
                warn!(
                    backend = %config.endpoint.backend,
                    "no tokenizer configured; token counts will be reported as 0"
                );
                Ok(executor)
            }
            (_, false) => Ok(executor),
        }
    }

    pub fn with_token_counter(mut self, tokens: Arc<dyn TokenCounter>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send `prompt` until a usable response arrives or the retry budget is
    /// spent. Only successful exchanges are recorded.
    pub async fn execute(
        &self,
        prompt: &Prompt,
        recorder: &LatencyRecorder,
        progress: &Progress,
    ) -> RequestResult {
        let body = self
            .codec
            .request_body(&prompt.text, &self.sampling, self.options.stream);
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            match self.attempt(&prompt.text, &body, started).await {
                Ok(exchange) => {
                    let total_latency = started.elapsed();
                    let Exchange {
                        generation,
                        first_token,
                        inter_token,
                    } = exchange;
                    recorder.record(RequestOutcome {
                        prompt_char_len: prompt.char_len(),
                        output_char_len: generation.text.chars().count().max(1),
                        input_token_count: generation.input_tokens,
                        output_token_count: generation.output_tokens,
                        total_latency,
                        first_token_latency: first_token,
                        inter_token_latencies: inter_token,
                    });
                    progress.inc();
                    debug!(index = prompt.index, output = %generation.text, "request completed");
                    return RequestResult::Completed(generation.text);
                }
                Err(err) => {
                    if !self.options.retry_limit.allows(retries) {
                        warn!(
                            index = prompt.index,
                            attempts = retries + 1,
                            "giving up on request: {err}"
                        );
                        progress.inc();
                        return RequestResult::Failed {
                            attempts: retries + 1,
                            last_error: err.to_string(),
                        };
                    }
                    retries += 1;
                    warn!(index = prompt.index, retries, "retrying request: {err}");
                }
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        body: &Value,
        started: Instant,
    ) -> Result<Exchange, AttemptError> {
        let stream = self.options.stream;
        let response = self
            .client
            .post(&self.url)
            .header(USER_AGENT, CLIENT_NAME)
            .json(body)
            .send()
            .await?;
        let status = response.status();

        let mut timing = StreamTiming::new(started);
        let mut received = Vec::new();
        let mut last_chunk: Vec<u8> = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            let trimmed = trim_nul(&chunk);
            if trimmed.is_empty() {
                continue;
            }
            if stream {
                timing.observe(Instant::now());
            }
            received.extend_from_slice(&chunk);
            last_chunk = trimmed.to_vec();
        }

        if !status.is_success() {
            return Err(AttemptError::Status {
                status,
                body: String::from_utf8_lossy(&received).into_owned(),
            });
        }

        let payload = if !stream {
            trim_nul(&received).to_vec()
        } else {
            match self.codec.stream_scope() {
                PayloadScope::EventStream => trim_nul(&received).to_vec(),
                PayloadScope::LastMessage => last_message(&received, last_chunk),
            }
        };
        let payload = String::from_utf8(payload)
            .map_err(|err| MalformedResponse(format!("response is not utf-8: {err}")))?;

        let response = self.codec.parse_terminal(&payload, stream)?;
        if self.codec.is_error(&response) {
            let detail = response.get("error").map(Value::to_string).unwrap_or_default();
            return Err(AttemptError::Endpoint(detail));
        }
        let generation = self
            .codec
            .decode(prompt, &response, stream, self.tokens.as_deref())?;

        Ok(Exchange {
            generation,
            first_token: timing.first_token.unwrap_or_default(),
            inter_token: timing.inter_token,
        })
    }
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != 0).map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Messages in a NUL-delimited stream may span transport chunks; the last
/// complete message wins over the last chunk when delimiters are present.
fn last_message(body: &[u8], last_chunk: Vec<u8>) -> Vec<u8> {
    if !body.contains(&0) {
        return last_chunk;
    }
    body.split(|b| *b == 0)
        .rev()
        .find(|segment| !segment.iter().all(u8::is_ascii_whitespace))
        .map(<[u8]>::to_vec)
        .unwrap_or(last_chunk)
}
