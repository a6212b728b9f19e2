//! Choice of the next request rate to measure.
//!
//! The first `min_iterations` trials step the rate up by a fixed amount.
//! After that, if latency bounds are configured, the search doubles the rate
//! while the fastest trial satisfies them, halves it while even the slowest
//! violates them, and otherwise bisects between the fastest satisfying and
//! the slowest violating rate. A rate that was already measured ends the
//! search.

use std::fmt;

/// Latency ceilings a trial must meet; `None` leaves a dimension unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyBounds {
    pub max_avg_latency: Option<f64>,
    pub max_first_token_latency: Option<f64>,
}

impl LatencyBounds {
    pub fn is_unbounded(&self) -> bool {
        self.max_avg_latency.is_none() && self.max_first_token_latency.is_none()
    }

    /// A trial with failed requests never satisfies the bounds: its averages
    /// cover only the requests that succeeded.
    pub fn satisfied_by(&self, trial: &RateTrial) -> bool {
        let within = |bound: Option<f64>, value: f64| bound.map_or(true, |max| value <= max);
        trial.failed_requests == 0
            && within(self.max_avg_latency, trial.mean_latency)
            && within(self.max_first_token_latency, trial.mean_first_token_latency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchPolicy {
    /// Rate of the first trial.
    pub base_rate: f64,
    /// Increment applied during the fixed-step phase.
    pub step: f64,
    pub min_iterations: usize,
    pub bounds: LatencyBounds,
    /// Corpus size; the upward probe never exceeds it.
    pub prompt_count: usize,
}

/// Measured outcome of one rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateTrial {
    pub request_rate: f64,
    pub mean_latency: f64,
    pub mean_first_token_latency: f64,
    pub failed_requests: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    /// Fixed-step phase finished and no latency bound is configured.
    Unconstrained,
    /// The next rate was already measured.
    DuplicateRate(f64),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Unconstrained => f.write_str("no latency bounds configured"),
            StopReason::DuplicateRate(rate) => write!(f, "duplicate request rate {rate} detected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NextRate {
    Probe(f64),
    Stop(StopReason),
}

/// `max(round(x, 1), 0.1)` with ties rounded to even.
pub fn round_to_tenth(value: f64) -> f64 {
    ((value * 10.0).round_ties_even() / 10.0).max(0.1)
}

#[derive(Debug, Clone)]
pub struct RateSearch {
    policy: SearchPolicy,
    trials: Vec<RateTrial>,
}

impl RateSearch {
    pub fn new(policy: SearchPolicy) -> Self {
        Self {
            policy,
            trials: Vec::new(),
        }
    }

    pub fn policy(&self) -> &SearchPolicy {
        &self.policy
    }

    /// Trials in the order they were measured.
    pub fn trials(&self) -> &[RateTrial] {
        &self.trials
    }

    pub fn record(&mut self, trial: RateTrial) {
        self.trials.push(trial);
    }

    pub fn next_rate(&self) -> NextRate {
        let policy = &self.policy;
        let Some(last) = self.trials.last() else {
            return NextRate::Probe(policy.base_rate);
        };

        if self.trials.len() < policy.min_iterations {
            return NextRate::Probe(last.request_rate + policy.step);
        }
        if policy.bounds.is_unbounded() {
            return NextRate::Stop(StopReason::Unconstrained);
        }

        let rate = self.constrained_rate();
        if self.trials.iter().any(|trial| trial.request_rate == rate) {
            NextRate::Stop(StopReason::DuplicateRate(rate))
        } else {
            NextRate::Probe(rate)
        }
    }

    fn constrained_rate(&self) -> f64 {
        let bounds = &self.policy.bounds;
        let mut by_rate = self.trials.clone();
        by_rate.sort_by(|a, b| a.request_rate.total_cmp(&b.request_rate));

        let (Some(lowest), Some(highest)) = (by_rate.first(), by_rate.last()) else {
            return self.policy.base_rate;
        };

        if bounds.satisfied_by(highest) {
            return (highest.request_rate * 2.0).min(self.policy.prompt_count as f64);
        }
        if !bounds.satisfied_by(lowest) {
            return round_to_tenth(lowest.request_rate / 2.0);
        }

        let fastest_ok = by_rate
            .iter()
            .filter(|trial| bounds.satisfied_by(trial))
            .map(|trial| trial.request_rate)
            .fold(f64::NEG_INFINITY, f64::max);
        let slowest_violating = by_rate
            .iter()
            .filter(|trial| !bounds.satisfied_by(trial))
            .map(|trial| trial.request_rate)
            .fold(f64::INFINITY, f64::min);
        round_to_tenth((fastest_ok + slowest_violating) / 2.0)
    }
}
