//! Benchmark campaign: warm up, measure, pick the next rate, repeat.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::error::Result;
use crate::metrics::{MetricsSnapshot, StreamMetrics};
use crate::recorder::LatencyRecorder;
use crate::round::RoundOutput;
use crate::search::{LatencyBounds, NextRate, RateSearch, RateTrial, SearchPolicy, StopReason};

/// Runs one full pass over the corpus at a given rate.
#[async_trait]
pub trait RoundDriver: Send {
    fn prompt_count(&self) -> usize;

    async fn run_round(&mut self, rate: f64, recorder: &LatencyRecorder) -> Result<RoundOutput>;
}

/// How each trial rate is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementPlan {
    pub concurrency: usize,
    pub warmup_iterations: usize,
    pub repeat_iterations: usize,
    /// Streaming latency breakdowns are reported only when requests stream.
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialReport {
    pub metrics: MetricsSnapshot,
    pub stream: Option<StreamMetrics>,
}

impl TrialReport {
    pub fn as_trial(&self) -> RateTrial {
        RateTrial {
            request_rate: self.metrics.request_rate,
            mean_latency: self.metrics.avg_latency,
            mean_first_token_latency: self
                .stream
                .map_or(0.0, |stream| stream.first_token_latency.avg),
            failed_requests: self.metrics.failed_requests,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CampaignReport {
    /// One entry per measured rate, in measurement order.
    pub trials: Vec<TrialReport>,
    /// Outputs of the last measured round.
    pub results: Vec<String>,
    pub stop: StopReason,
}

impl CampaignReport {
    /// Highest measured rate whose averages stay within `bounds` with no
    /// failed requests.
    pub fn best_rate(&self, bounds: &LatencyBounds) -> Option<f64> {
        self.trials
            .iter()
            .map(TrialReport::as_trial)
            .filter(|trial| bounds.satisfied_by(trial))
            .map(|trial| trial.request_rate)
            .max_by(f64::total_cmp)
    }
}

/// Repeat rounds at one rate feeding a shared recorder.
struct Measurement {
    rate: f64,
    iteration: usize,
    recorder: LatencyRecorder,
    started: Instant,
    failed: usize,
    results: Vec<String>,
}

enum Phase {
    Decide,
    WarmUp { rate: f64, iteration: usize },
    Measure(Measurement),
}

pub struct Campaign {
    search: RateSearch,
    plan: MeasurementPlan,
}

impl Campaign {
    pub fn new(policy: SearchPolicy, plan: MeasurementPlan) -> Self {
        Self {
            search: RateSearch::new(policy),
            plan,
        }
    }

    pub async fn run<D: RoundDriver>(mut self, driver: &mut D) -> Result<CampaignReport> {
        let mut trials = Vec::new();
        let mut results = Vec::new();
        let mut phase = Phase::Decide;

        let stop = loop {
            phase = match phase {
                Phase::Decide => match self.search.next_rate() {
                    NextRate::Probe(rate) => self.begin(rate),
                    NextRate::Stop(reason) => break reason,
                },
                Phase::WarmUp { rate, iteration } => {
                    info!("Start warmup iteration {iteration} with request rate {rate:.3}");
                    driver.run_round(rate, &LatencyRecorder::new()).await?;
                    if iteration + 1 < self.plan.warmup_iterations {
                        Phase::WarmUp {
                            rate,
                            iteration: iteration + 1,
                        }
                    } else {
                        Phase::Measure(Measurement::start(rate))
                    }
                }
                Phase::Measure(mut measurement) => {
                    info!(
                        "Start profile iteration {} with request rate {:.3}",
                        measurement.iteration, measurement.rate
                    );
                    let output = driver
                        .run_round(measurement.rate, &measurement.recorder)
                        .await?;
                    measurement.failed += output.failed;
                    measurement.results = output.results;
                    measurement.iteration += 1;

                    if measurement.iteration < self.plan.repeat_iterations {
                        Phase::Measure(measurement)
                    } else {
                        let (report, outputs) = self.conclude(measurement, driver.prompt_count());
                        trials.push(report);
                        results = outputs;
                        Phase::Decide
                    }
                }
            };
        };

        info!("Rate search finished after {} trials: {stop}", trials.len());
        Ok(CampaignReport {
            trials,
            results,
            stop,
        })
    }

    fn begin(&self, rate: f64) -> Phase {
        if self.plan.warmup_iterations > 0 {
            Phase::WarmUp { rate, iteration: 0 }
        } else {
            Phase::Measure(Measurement::start(rate))
        }
    }

    fn conclude(
        &mut self,
        measurement: Measurement,
        prompt_count: usize,
    ) -> (TrialReport, Vec<String>) {
        let repeats = self.plan.repeat_iterations.max(1) as f64;
        let total_latency = measurement.started.elapsed().div_f64(repeats);
        let outcomes = measurement.recorder.snapshot();

        let metrics = MetricsSnapshot::compute(
            measurement.rate,
            self.plan.concurrency,
            prompt_count,
            total_latency,
            &outcomes,
            measurement.failed,
        );
        info!("\n{metrics}");
        let stream = self.plan.stream.then(|| StreamMetrics::compute(&outcomes));
        if let Some(stream) = &stream {
            info!("\n{stream}");
        }

        let report = TrialReport { metrics, stream };
        self.search.record(report.as_trial());
        (report, measurement.results)
    }
}

impl Measurement {
    fn start(rate: f64) -> Self {
        Self {
            rate,
            iteration: 0,
            recorder: LatencyRecorder::new(),
            started: Instant::now(),
            failed: 0,
            results: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RequestOutcome;
    use std::time::Duration;

    /// Latency grows linearly with the rate, plus `slowdown_per_round` for
    /// every round already run; every round takes one second.
    struct LinearDriver {
        prompts: usize,
        latency_per_rate: f64,
        slowdown_per_round: f64,
        rounds: Vec<f64>,
        /// Outcomes held by the round's recorder once it finishes.
        recorded: Vec<usize>,
        failures_per_round: usize,
    }

    impl LinearDriver {
        fn new(prompts: usize, latency_per_rate: f64) -> Self {
            Self {
                prompts,
                latency_per_rate,
                slowdown_per_round: 0.0,
                rounds: Vec::new(),
                recorded: Vec::new(),
                failures_per_round: 0,
            }
        }
    }

    #[async_trait]
    impl RoundDriver for LinearDriver {
        fn prompt_count(&self) -> usize {
            self.prompts
        }

        async fn run_round(&mut self, rate: f64, recorder: &LatencyRecorder) -> Result<RoundOutput> {
            let secs = rate * self.latency_per_rate
                + self.rounds.len() as f64 * self.slowdown_per_round;
            let latency = Duration::from_secs_f64(secs);
            self.rounds.push(rate);
            let succeeded = self.prompts - self.failures_per_round;
            for _ in 0..succeeded {
                recorder.record(RequestOutcome {
                    prompt_char_len: 4,
                    output_char_len: 2,
                    input_token_count: 2,
                    output_token_count: 3,
                    total_latency: latency,
                    first_token_latency: latency / 4,
                    inter_token_latencies: vec![latency / 8],
                });
            }
            self.recorded.push(recorder.len());
            tokio::time::sleep(Duration::from_secs(1)).await;
            let mut results = vec![format!("out@{rate}"); self.prompts];
            for slot in results.iter_mut().take(self.failures_per_round) {
                slot.clear();
            }
            Ok(RoundOutput {
                results,
                failed: self.failures_per_round,
                elapsed: Duration::from_secs(1),
            })
        }
    }

    fn policy(base_rate: f64, min_iterations: usize, max_avg_latency: Option<f64>) -> SearchPolicy {
        SearchPolicy {
            base_rate,
            step: 1.0,
            min_iterations,
            bounds: LatencyBounds {
                max_avg_latency,
                max_first_token_latency: None,
            },
            prompt_count: 100,
        }
    }

    fn plan(warmup_iterations: usize, repeat_iterations: usize, stream: bool) -> MeasurementPlan {
        MeasurementPlan {
            concurrency: 1,
            warmup_iterations,
            repeat_iterations,
            stream,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_without_bounds() {
        let mut driver = LinearDriver::new(4, 0.1);
        let report = Campaign::new(policy(2.0, 1, None), plan(0, 1, false))
            .run(&mut driver)
            .await
            .unwrap();

        assert_eq!(driver.rounds, vec![2.0]);
        assert_eq!(report.trials.len(), 1);
        assert_eq!(report.stop, StopReason::Unconstrained);
        assert_eq!(report.results, vec!["out@2".to_string(); 4]);
        assert!(report.trials[0].stream.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_and_repeats_run_at_trial_rate() {
        let mut driver = LinearDriver::new(4, 0.1);
        driver.slowdown_per_round = 0.1;
        let report = Campaign::new(policy(2.0, 2, None), plan(1, 2, true))
            .run(&mut driver)
            .await
            .unwrap();

        // per trial: one warm-up round then two measured rounds
        assert_eq!(driver.rounds, vec![2.0, 2.0, 2.0, 3.0, 3.0, 3.0]);
        // warm-up rounds get their own recorder; repeats share one
        assert_eq!(driver.recorded, vec![4, 4, 8, 4, 4, 8]);
        assert_eq!(report.trials.len(), 2);

        let first = &report.trials[0].metrics;
        assert_eq!(first.request_rate, 2.0);
        // two one-second rounds divided by two repeats
        assert!((first.total_latency - 1.0).abs() < 1e-3);
        assert!((first.request_throughput - 4.0).abs() < 1e-2);
        // measured rounds ran at 0.3s and 0.4s; the 0.2s warm-up is excluded
        assert!((first.avg_latency - 0.35).abs() < 1e-6);

        // 0.6s, 0.7s and 0.8s rounds at 3.0; only the last two count
        let second = &report.trials[1];
        assert!((second.metrics.avg_latency - 0.75).abs() < 1e-6);
        let stream = second.stream.unwrap();
        assert!((stream.first_token_latency.avg - 0.1875).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_converges_on_latency_bound() {
        // latency = rate * 0.25, so rates up to 4.0 satisfy a 1s bound
        let mut driver = LinearDriver::new(100, 0.25);
        let report = Campaign::new(policy(1.0, 1, Some(1.0)), plan(0, 1, false))
            .run(&mut driver)
            .await
            .unwrap();

        assert_eq!(&driver.rounds[..4], &[1.0, 2.0, 4.0, 8.0]);
        assert!(matches!(report.stop, StopReason::DuplicateRate(_)));
        let bounds = LatencyBounds {
            max_avg_latency: Some(1.0),
            max_first_token_latency: None,
        };
        assert_eq!(report.best_rate(&bounds), Some(4.0));
        assert!(driver.rounds.iter().all(|rate| *rate >= 0.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requests_reach_snapshot() {
        let mut driver = LinearDriver::new(3, 0.1);
        driver.failures_per_round = 1;
        let report = Campaign::new(policy(1.0, 1, None), plan(0, 2, false))
            .run(&mut driver)
            .await
            .unwrap();

        assert_eq!(report.trials[0].metrics.failed_requests, 2);
        assert_eq!(report.results[0], "");
        assert_eq!(report.results[1], "out@1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_failing_rates_never_meet_bounds() {
        let mut driver = LinearDriver::new(16, 0.01);
        driver.failures_per_round = 16;
        let report = Campaign::new(policy(1.0, 1, Some(1.0)), plan(0, 1, false))
            .run(&mut driver)
            .await
            .unwrap();

        // no latency is recorded, yet every rate counts as a violation
        assert_eq!(driver.rounds, vec![1.0, 0.5, 0.2, 0.1]);
        assert_eq!(report.stop, StopReason::DuplicateRate(0.1));
        assert!(report
            .trials
            .iter()
            .all(|trial| trial.metrics.failed_requests == 16 && trial.metrics.avg_latency == 0.0));
        let bounds = LatencyBounds {
            max_avg_latency: Some(1.0),
            max_first_token_latency: None,
        };
        assert_eq!(report.best_rate(&bounds), None);
    }
}
