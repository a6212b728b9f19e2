//! Per-request latency records and progress accounting.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

/// Timing and size record for one completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub prompt_char_len: usize,
    /// Never below 1, so empty generations still count as one character.
    pub output_char_len: usize,
    pub input_token_count: usize,
    pub output_token_count: usize,
    pub total_latency: Duration,
    /// Zero for non-streaming requests.
    pub first_token_latency: Duration,
    /// Empty for non-streaming requests.
    pub inter_token_latencies: Vec<Duration>,
}

impl RequestOutcome {
    /// Average decode time per output token after the first.
    ///
    /// `None` unless more than one output token was produced.
    pub fn time_per_output_token(&self) -> Option<f64> {
        if self.output_token_count <= 1 {
            return None;
        }
        let decode = self.total_latency.as_secs_f64() - self.first_token_latency.as_secs_f64();
        Some(decode / (self.output_token_count - 1) as f64)
    }
}

/// Append-only collection of outcomes for one measurement.
///
/// Cloning shares the underlying buffer, so a recorder handed to request
/// tasks accumulates into the owner's view. A fresh recorder is created per
/// measurement instead of clearing a global one.
#[derive(Debug, Clone, Default)]
pub struct LatencyRecorder {
    outcomes: Arc<Mutex<Vec<RequestOutcome>>>,
}

impl LatencyRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: RequestOutcome) {
        self.outcomes.lock().push(outcome);
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<RequestOutcome> {
        self.outcomes.lock().clone()
    }
}

/// Completed-request counter with an optional terminal progress bar.
#[derive(Clone)]
pub struct Progress {
    completed: Arc<AtomicUsize>,
    bar: ProgressBar,
}

impl Progress {
    pub fn new(total: usize, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(total as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}<{eta_precise}]")
            {
                bar.set_style(style);
            }
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            completed: Arc::new(AtomicUsize::new(0)),
            bar,
        }
    }

    pub fn hidden(total: usize) -> Self {
        Self::new(total, false)
    }

    pub fn inc(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bar.inc(1);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("completed", &self.completed())
            .finish()
    }
}
