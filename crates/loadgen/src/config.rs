//! Benchmark configuration.
//!
//! Values are layered from built-in defaults, an optional configuration file
//! and `SERVEBENCH_*` environment variables (`__` separates sections, e.g.
//! `SERVEBENCH_LOAD__CONCURRENCY=8`). Command-line overrides are applied by
//! the binary on top of the loaded value.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ::config::{Config, Environment, File as ConfigFile};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::backend::BackendKind;
use crate::campaign::MeasurementPlan;
use crate::error::{LoadgenError, Result};
use crate::search::{LatencyBounds, SearchPolicy};
use crate::template::ModelType;

const ENV_PREFIX: &str = "SERVEBENCH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub endpoint: EndpointConfig,
    pub corpus: CorpusConfig,
    pub load: LoadConfig,
    pub search: SearchConfig,
    pub sampling: SamplingConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Target endpoint and per-request transport policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    /// Overall per-request timeout; expiry is retried like an endpoint error.
    pub timeout_secs: u64,
    pub max_retries: RetryLimit,
    /// `tokenizer.json` used by backends that do not report token counts.
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            backend: BackendKind::Ksana,
            timeout_secs: 30 * 3600,
            max_retries: RetryLimit::default(),
            tokenizer_path: None,
        }
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    pub input_csv: PathBuf,
    pub col_idx: usize,
    pub skip_header: bool,
    /// Requested prompt count; 0 keeps the corpus as read.
    pub prompt_num: usize,
    pub model_type: ModelType,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            input_csv: PathBuf::from("benchmark_input.csv"),
            col_idx: 0,
            skip_header: true,
            prompt_num: 0,
            model_type: ModelType::Llama,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Requests per second; `inf` releases the whole corpus at once.
    pub request_rate: f64,
    pub concurrency: usize,
    pub stream: bool,
    pub mode: ExecutionMode,
    /// Draw inter-batch gaps from an exponential distribution.
    pub random: bool,
    pub seed: u64,
    pub progress: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            request_rate: f64::INFINITY,
            concurrency: 1,
            stream: false,
            mode: ExecutionMode::Async,
            random: false,
            seed: 0,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub request_rate_step: f64,
    pub request_rate_num_iters: usize,
    pub max_avg_latency: Option<f64>,
    pub max_first_token_latency: Option<f64>,
    pub warmup_num_iters: usize,
    pub repeat_num_iters: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            request_rate_step: 1.0,
            request_rate_num_iters: 1,
            max_avg_latency: None,
            max_first_token_latency: None,
            warmup_num_iters: 0,
            repeat_num_iters: 1,
        }
    }
}

/// Generation parameters forwarded to the endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub max_new_tokens: u32,
    pub temperature: f64,
    pub topk: u32,
    pub topp: f64,
    pub repetition_penalty: f64,
    pub length_penalty: f64,
    pub num_beams: u32,
    pub num_return_sequences: u32,
    pub logprobs: u32,
    pub stop_token_ids: Vec<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: 0.0,
            topk: 1,
            topp: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            num_beams: 1,
            num_return_sequences: 1,
            logprobs: 0,
            stop_token_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_csv: Option<PathBuf>,
    pub perf_csv: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// How released requests are driven within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Every released request runs as its own task.
    Async,
    /// Each request completes before the scheduler is polled again.
    Sync,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "async" => Ok(ExecutionMode::Async),
            "sync" => Ok(ExecutionMode::Sync),
            other => Err(format!("unknown execution mode '{other}' (expected async or sync)")),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ExecutionMode::Async => "async",
            ExecutionMode::Sync => "sync",
        };
        f.write_str(value)
    }
}

/// Ceiling on re-attempts of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Unlimited,
    Limited(u32),
}

impl RetryLimit {
    /// Whether another attempt is allowed after `retries` re-attempts.
    pub fn allows(&self, retries: u32) -> bool {
        match self {
            RetryLimit::Unlimited => true,
            RetryLimit::Limited(max) => retries < *max,
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        RetryLimit::Limited(16)
    }
}

impl FromStr for RetryLimit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("unlimited") {
            return Ok(RetryLimit::Unlimited);
        }
        value
            .parse::<u32>()
            .map(RetryLimit::Limited)
            .map_err(|_| format!("invalid retry limit '{value}' (expected a count or 'unlimited')"))
    }
}

impl fmt::Display for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryLimit::Unlimited => f.write_str("unlimited"),
            RetryLimit::Limited(max) => write!(f, "{max}"),
        }
    }
}

impl<'de> Deserialize<'de> for RetryLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RetryLimitVisitor;

        impl Visitor<'_> for RetryLimitVisitor {
            type Value = RetryLimit;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative retry count or \"unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<RetryLimit, E> {
                u32::try_from(value)
                    .map(RetryLimit::Limited)
                    .map_err(|_| E::custom(format!("retry limit {value} is too large")))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<RetryLimit, E> {
                u64::try_from(value)
                    .map_err(|_| E::custom("retry limit must not be negative"))
                    .and_then(|value| self.visit_u64(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<RetryLimit, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(RetryLimitVisitor)
    }
}

impl BenchConfig {
    /// Load defaults, then `path` (if any), then `SERVEBENCH_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(LoadgenError::config(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sampling.stop_token_ids")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Reject values that would make the campaign meaningless, before any
    /// request is sent.
    pub fn validate(&self) -> Result<()> {
        let rate = self.load.request_rate;
        if rate.is_nan() || rate <= 0.0 {
            return Err(LoadgenError::config(format!(
                "request_rate must be > 0 (got {rate})"
            )));
        }
        if self.load.concurrency == 0 {
            return Err(LoadgenError::config("concurrency must be > 0"));
        }
        if rate.is_finite()
            && Duration::try_from_secs_f64(self.load.concurrency as f64 / rate).is_err()
        {
            return Err(LoadgenError::config(format!(
                "request_rate {rate} is too low for concurrency {}",
                self.load.concurrency
            )));
        }
        if self.search.repeat_num_iters == 0 {
            return Err(LoadgenError::config("repeat_num_iters must be > 0"));
        }
        let step = self.search.request_rate_step;
        if !step.is_finite() || step < 0.0 {
            return Err(LoadgenError::config(format!(
                "request_rate_step must be a finite value >= 0 (got {step})"
            )));
        }
        for (name, bound) in [
            ("max_avg_latency", self.search.max_avg_latency),
            ("max_first_token_latency", self.search.max_first_token_latency),
        ] {
            if let Some(bound) = bound {
                if bound.is_nan() || bound <= 0.0 {
                    return Err(LoadgenError::config(format!(
                        "{name} must be > 0 seconds (got {bound})"
                    )));
                }
            }
        }
        if self.endpoint.timeout_secs == 0 {
            return Err(LoadgenError::config("timeout_secs must be > 0"));
        }
        if self.search.max_first_token_latency.is_some() && !self.load.stream {
            tracing::warn!(
                "max_first_token_latency is set but streaming is disabled; first-token latency is only measured when streaming"
            );
        }
        Ok(())
    }

    /// Model type actually applied to prompts; chat servers template on their side.
    pub fn effective_model_type(&self) -> ModelType {
        if self.endpoint.backend.applies_server_template() {
            ModelType::Empty
        } else {
            self.corpus.model_type
        }
    }

    /// Stop tokens sent with each request, falling back to the model default.
    pub fn stop_token_ids(&self) -> Vec<u32> {
        if self.sampling.stop_token_ids.is_empty() {
            self.effective_model_type().default_stop_token_ids().to_vec()
        } else {
            self.sampling.stop_token_ids.clone()
        }
    }

    pub fn search_policy(&self, prompt_count: usize) -> SearchPolicy {
        SearchPolicy {
            base_rate: self.load.request_rate,
            step: self.search.request_rate_step,
            min_iterations: self.search.request_rate_num_iters,
            bounds: LatencyBounds {
                max_avg_latency: self.search.max_avg_latency,
                max_first_token_latency: self.search.max_first_token_latency,
            },
            prompt_count,
        }
    }

    pub fn measurement_plan(&self) -> MeasurementPlan {
        MeasurementPlan {
            concurrency: self.load.concurrency,
            warmup_iterations: self.search.warmup_num_iters,
            repeat_iterations: self.search.repeat_num_iters,
            stream: self.load.stream,
        }
    }
}
