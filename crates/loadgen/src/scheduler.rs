//! Request arrival pacing.
//!
//! Prompts are released in batches of `concurrency`. Between batches the
//! scheduler sleeps `concurrency / rate` seconds, or a sample from an
//! exponential distribution with that mean when jitter is enabled. An
//! infinite rate releases everything at once.

use std::time::Duration;

use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp};

use crate::corpus::Prompt;

pub struct ArrivalScheduler<'a> {
    prompts: &'a [Prompt],
    rate: f64,
    concurrency: usize,
    jitter: Option<&'a mut StdRng>,
    next: usize,
    released_in_batch: usize,
}

impl<'a> ArrivalScheduler<'a> {
    pub fn new(
        prompts: &'a [Prompt],
        rate: f64,
        concurrency: usize,
        jitter: Option<&'a mut StdRng>,
    ) -> Self {
        Self {
            prompts,
            rate,
            concurrency: concurrency.max(1),
            jitter,
            next: 0,
            released_in_batch: 0,
        }
    }

    /// Mean gap between batches, `None` in burst mode. Gaps too long for a
    /// `Duration` saturate.
    pub fn batch_interval(&self) -> Option<Duration> {
        if self.rate.is_finite() && self.rate > 0.0 {
            Some(saturating_secs(self.concurrency as f64 / self.rate))
        } else {
            None
        }
    }

    /// Release the next prompt, waiting first if the current batch is full.
    pub async fn next(&mut self) -> Option<&'a Prompt> {
        let prompts = self.prompts;
        let prompt = prompts.get(self.next)?;

        if self.released_in_batch == self.concurrency {
            self.released_in_batch = 0;
            if let Some(gap) = self.next_gap() {
                tokio::time::sleep(gap).await;
            }
        }

        self.next += 1;
        self.released_in_batch += 1;
        Some(prompt)
    }

    fn next_gap(&mut self) -> Option<Duration> {
        let mean = self.batch_interval()?;
        let Some(rng) = self.jitter.as_deref_mut() else {
            return Some(mean);
        };
        let secs = match Exp::new(1.0 / mean.as_secs_f64()) {
            Ok(exp) => exp.sample(rng),
            Err(_) => mean.as_secs_f64(),
        };
        Some(saturating_secs(secs))
    }
}

fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
