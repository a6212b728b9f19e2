use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use servebench_loadgen::config::LoggingConfig;
use servebench_loadgen::{
    load_prompts, write_outputs, write_perf, BackendKind, BenchConfig, Campaign, ExecutionMode,
    LatencyBounds, ModelType, RequestExecutor, RetryLimit, RoundRunner,
};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Find the highest request rate a text-generation endpoint sustains within latency bounds"
)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    // endpoint
    /// Server host address
    #[arg(long)]
    host: Option<String>,
    /// Server port
    #[arg(long)]
    port: Option<u16>,
    /// Serving backend (ksana, vllm, ksana-server, vllm-server, trt-llm, evart, mindie-service)
    #[arg(long)]
    backend: Option<BackendKind>,
    /// Overall per-request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Re-attempts per request: a count or "unlimited"
    #[arg(long)]
    max_retries: Option<RetryLimit>,
    /// tokenizer.json for backends that do not report token counts
    #[arg(long, value_name = "PATH")]
    tokenizer_path: Option<PathBuf>,

    // corpus
    /// Prompt corpus CSV
    #[arg(long, value_name = "PATH")]
    input_csv: Option<PathBuf>,
    /// Column of the corpus holding the prompt
    #[arg(long)]
    col_idx: Option<usize>,
    /// Treat the first corpus row as a header
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    skip_header: Option<bool>,
    /// Number of prompts to send per round (0 keeps the corpus size)
    #[arg(long)]
    prompt_num: Option<usize>,
    /// Chat template (llama, llama-3, baichuan, qwen, vicuna, yi, chatglm, empty)
    #[arg(long)]
    model_type: Option<ModelType>,

    // load
    /// Requests per second; "inf" sends every prompt at once
    #[arg(long)]
    request_rate: Option<f64>,
    /// Prompts released per batch
    #[arg(long)]
    concurrency: Option<usize>,
    /// Request streamed responses and measure TTFT and ITL
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    stream: Option<bool>,
    /// async runs every request as its own task; sync awaits each in turn
    #[arg(long)]
    mode: Option<ExecutionMode>,
    /// Draw batch gaps from an exponential distribution
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    random: Option<bool>,
    /// Seed for randomized batch gaps
    #[arg(long)]
    seed: Option<u64>,
    /// Show a progress bar per round
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    progress: Option<bool>,

    // search
    /// Rate increment between the first trials
    #[arg(long)]
    request_rate_step: Option<f64>,
    /// Number of fixed-step trials before the latency-driven search
    #[arg(long)]
    request_rate_num_iters: Option<usize>,
    /// Average latency bound in seconds
    #[arg(long)]
    max_avg_latency: Option<f64>,
    /// Average first-token latency bound in seconds
    #[arg(long)]
    max_first_token_latency: Option<f64>,
    /// Unmeasured rounds before each trial
    #[arg(long)]
    warmup_num_iters: Option<usize>,
    /// Measured rounds per trial
    #[arg(long)]
    repeat_num_iters: Option<usize>,

    // sampling
    #[arg(long)]
    max_new_tokens: Option<u32>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    topk: Option<u32>,
    #[arg(long)]
    topp: Option<f64>,
    #[arg(long)]
    repetition_penalty: Option<f64>,
    #[arg(long)]
    length_penalty: Option<f64>,
    #[arg(long)]
    num_beams: Option<u32>,
    #[arg(long)]
    num_return_sequences: Option<u32>,
    #[arg(long)]
    logprobs: Option<u32>,
    /// Comma-separated stop token ids; defaults to the model type's list
    #[arg(long, value_delimiter = ',')]
    stop_token_ids: Option<Vec<u32>>,

    // output
    /// Write generated texts here
    #[arg(long, value_name = "PATH")]
    output_csv: Option<PathBuf>,
    /// Write one metrics row per trial here
    #[arg(long, value_name = "PATH")]
    perf_csv: Option<PathBuf>,

    // logging
    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,
    /// pretty or compact
    #[arg(long)]
    log_format: Option<String>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl Cli {
    fn apply(self, config: &mut BenchConfig) {
        let endpoint = &mut config.endpoint;
        set(&mut endpoint.host, self.host);
        set(&mut endpoint.port, self.port);
        set(&mut endpoint.backend, self.backend);
        set(&mut endpoint.timeout_secs, self.timeout_secs);
        set(&mut endpoint.max_retries, self.max_retries);
        if self.tokenizer_path.is_some() {
            endpoint.tokenizer_path = self.tokenizer_path;
        }

        let corpus = &mut config.corpus;
        set(&mut corpus.input_csv, self.input_csv);
        set(&mut corpus.col_idx, self.col_idx);
        set(&mut corpus.skip_header, self.skip_header);
        set(&mut corpus.prompt_num, self.prompt_num);
        set(&mut corpus.model_type, self.model_type);

        let load = &mut config.load;
        set(&mut load.request_rate, self.request_rate);
        set(&mut load.concurrency, self.concurrency);
        set(&mut load.stream, self.stream);
        set(&mut load.mode, self.mode);
        set(&mut load.random, self.random);
        set(&mut load.seed, self.seed);
        set(&mut load.progress, self.progress);

        let search = &mut config.search;
        set(&mut search.request_rate_step, self.request_rate_step);
        set(&mut search.request_rate_num_iters, self.request_rate_num_iters);
        if self.max_avg_latency.is_some() {
            search.max_avg_latency = self.max_avg_latency;
        }
        if self.max_first_token_latency.is_some() {
            search.max_first_token_latency = self.max_first_token_latency;
        }
        set(&mut search.warmup_num_iters, self.warmup_num_iters);
        set(&mut search.repeat_num_iters, self.repeat_num_iters);

        let sampling = &mut config.sampling;
        set(&mut sampling.max_new_tokens, self.max_new_tokens);
        set(&mut sampling.temperature, self.temperature);
        set(&mut sampling.topk, self.topk);
        set(&mut sampling.topp, self.topp);
        set(&mut sampling.repetition_penalty, self.repetition_penalty);
        set(&mut sampling.length_penalty, self.length_penalty);
        set(&mut sampling.num_beams, self.num_beams);
        set(&mut sampling.num_return_sequences, self.num_return_sequences);
        set(&mut sampling.logprobs, self.logprobs);
        set(&mut sampling.stop_token_ids, self.stop_token_ids);

        if self.output_csv.is_some() {
            config.output.output_csv = self.output_csv;
        }
        if self.perf_csv.is_some() {
            config.output.perf_csv = self.perf_csv;
        }

        set(&mut config.logging.level, self.log_level);
        set(&mut config.logging.format, self.log_format);
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid log level '{}'", logging.level))?,
    };

    match logging.format.as_str() {
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?,
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?,
        other => bail!("unknown log format '{other}' (expected pretty or compact)"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = BenchConfig::load(cli.config.as_deref()).context("load configuration")?;
    cli.apply(&mut config);

    init_logging(&config.logging)?;
    config.validate()?;

    let prompts = load_prompts(&config).with_context(|| {
        format!("load prompts from {}", config.corpus.input_csv.display())
    })?;
    let prompt_count = prompts.len();

    let executor = Arc::new(RequestExecutor::from_config(&config).context("build request executor")?);
    info!(
        url = executor.url(),
        backend = %config.endpoint.backend,
        model_type = %config.effective_model_type(),
        prompts = prompt_count,
        mode = %config.load.mode,
        stream = config.load.stream,
        "starting benchmark"
    );

    let mut runner = RoundRunner::from_config(&config, executor, prompts);
    let campaign = Campaign::new(config.search_policy(prompt_count), config.measurement_plan());
    let report = campaign.run(&mut runner).await?;

    if let Some(path) = &config.output.output_csv {
        write_outputs(path, &report.results)
            .with_context(|| format!("write outputs to {}", path.display()))?;
    }
    if let Some(path) = &config.output.perf_csv {
        write_perf(path, &report.trials, config.load.stream)
            .with_context(|| format!("write performance report to {}", path.display()))?;
    }

    let bounds = LatencyBounds {
        max_avg_latency: config.search.max_avg_latency,
        max_first_token_latency: config.search.max_first_token_latency,
    };
    let failed: usize = report.trials.iter().map(|t| t.metrics.failed_requests).sum();
    if bounds.is_unbounded() {
        info!(trials = report.trials.len(), failed, "benchmark complete");
        return Ok(());
    }
    match report.best_rate(&bounds) {
        Some(rate) => info!(
            trials = report.trials.len(),
            failed,
            "highest request rate within latency bounds: {rate:.2} requests/s"
        ),
        None => info!(
            trials = report.trials.len(),
            failed,
            "no measured request rate met the latency bounds"
        ),
    }
    Ok(())
}
