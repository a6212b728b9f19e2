//! Servebench load generator: paced request arrival against text-generation
//! endpoints, streaming latency capture, and an adaptive search for the
//! highest request rate that meets latency bounds.
//!
//! A [`Campaign`] drives rounds through a [`RoundDriver`]. The production
//! driver, [`RoundRunner`], releases the corpus through an
//! [`ArrivalScheduler`] and sends each prompt with a [`RequestExecutor`].

pub mod backend;
pub mod campaign;
pub mod config;
pub mod corpus;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod recorder;
pub mod report;
pub mod round;
pub mod scheduler;
pub mod search;
pub mod template;
pub mod tokens;

pub use backend::{BackendCodec, BackendKind, Generation};
pub use campaign::{Campaign, CampaignReport, MeasurementPlan, RoundDriver, TrialReport};
pub use crate::config::{BenchConfig, ExecutionMode, RetryLimit};
pub use corpus::{adjust_prompt_count, load_prompts, read_corpus, Prompt};
pub use error::{LoadgenError, Result};
pub use executor::{ExecutorOptions, RequestExecutor, RequestResult};
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use recorder::{LatencyRecorder, Progress, RequestOutcome};
pub use report::{write_outputs, write_perf};
pub use round::{RoundOutput, RoundRunner};
pub use scheduler::ArrivalScheduler;
pub use search::{LatencyBounds, RateSearch, RateTrial, SearchPolicy, StopReason};
pub use template::ModelType;
pub use tokens::{HfTokenCounter, TokenCounter};
