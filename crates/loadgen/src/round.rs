//! A round sends every prompt in the corpus once at a given rate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;

use crate::campaign::RoundDriver;
use crate::config::{BenchConfig, ExecutionMode};
use crate::corpus::Prompt;
use crate::error::Result;
use crate::executor::{RequestExecutor, RequestResult};
use crate::recorder::{LatencyRecorder, Progress};
use crate::scheduler::ArrivalScheduler;

#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutput {
    /// Decoded text per prompt index; empty where the request failed.
    pub results: Vec<String>,
    pub failed: usize,
    pub elapsed: Duration,
}

pub struct RoundRunner {
    executor: Arc<RequestExecutor>,
    prompts: Arc<[Prompt]>,
    concurrency: usize,
    mode: ExecutionMode,
    /// Seeded once per campaign so successive rounds continue the sequence.
    jitter: Option<StdRng>,
    show_progress: bool,
}

impl RoundRunner {
    pub fn new(executor: Arc<RequestExecutor>, prompts: Vec<Prompt>, concurrency: usize) -> Self {
        Self {
            executor,
            prompts: prompts.into(),
            concurrency: concurrency.max(1),
            mode: ExecutionMode::Async,
            jitter: None,
            show_progress: false,
        }
    }

    pub fn from_config(
        config: &BenchConfig,
        executor: Arc<RequestExecutor>,
        prompts: Vec<Prompt>,
    ) -> Self {
        let runner = Self::new(executor, prompts, config.load.concurrency)
            .with_mode(config.load.mode)
            .with_progress(config.load.progress);
        if config.load.random {
            runner.with_jitter(config.load.seed)
        } else {
            runner
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_jitter(mut self, seed: u64) -> Self {
        self.jitter = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_progress(mut self, visible: bool) -> Self {
        self.show_progress = visible;
        self
    }
}

fn settle(slots: &mut [String], failed: &mut usize, index: usize, result: RequestResult) {
    match result {
        RequestResult::Completed(text) => slots[index] = text,
        RequestResult::Failed { .. } => *failed += 1,
    }
}

#[async_trait]
impl RoundDriver for RoundRunner {
    fn prompt_count(&self) -> usize {
        self.prompts.len()
    }

    async fn run_round(&mut self, rate: f64, recorder: &LatencyRecorder) -> Result<RoundOutput> {
        let started = Instant::now();
        let count = self.prompts.len();
        let progress = Progress::new(count, self.show_progress);
        let mut slots = vec![String::new(); count];
        let mut failed = 0usize;

        let prompts = Arc::clone(&self.prompts);
        let mode = self.mode;
        let mut scheduler =
            ArrivalScheduler::new(&prompts, rate, self.concurrency, self.jitter.as_mut());

        match mode {
            ExecutionMode::Sync => {
                while let Some(prompt) = scheduler.next().await {
                    let result = self.executor.execute(prompt, recorder, &progress).await;
                    settle(&mut slots, &mut failed, prompt.index, result);
                }
            }
            ExecutionMode::Async => {
                let mut tasks = JoinSet::new();
                while let Some(prompt) = scheduler.next().await {
                    let executor = Arc::clone(&self.executor);
                    let recorder = recorder.clone();
                    let progress = progress.clone();
                    let prompt = prompt.clone();
                    tasks.spawn(async move {
                        let result = executor.execute(&prompt, &recorder, &progress).await;
                        (prompt.index, result)
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    let (index, result) = joined?;
                    settle(&mut slots, &mut failed, index, result);
                }
            }
        }

        progress.finish();
        let elapsed = started.elapsed();
        debug!(
            rate,
            requests = count,
            failed,
            elapsed_secs = elapsed.as_secs_f64(),
            "round finished"
        );
        Ok(RoundOutput {
            results: slots,
            failed,
            elapsed,
        })
    }
}
