//! Aggregate metrics over the outcomes of one measurement.

use std::fmt;
use std::time::Duration;

use crate::recorder::RequestOutcome;

/// Throughput and average-size figures for one trial rate.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub request_rate: f64,
    pub concurrency: usize,
    /// Seconds per repeat of the measured rounds.
    pub total_latency: f64,
    pub request_throughput: f64,
    pub avg_latency: f64,
    pub avg_input_chars: f64,
    pub avg_output_chars: f64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub token_throughput: f64,
    pub failed_requests: usize,
}

impl MetricsSnapshot {
    /// `prompt_count` is the corpus size, which throughput is normalised by
    /// even when some requests failed.
    pub fn compute(
        request_rate: f64,
        concurrency: usize,
        prompt_count: usize,
        total_latency: Duration,
        outcomes: &[RequestOutcome],
        failed_requests: usize,
    ) -> Self {
        let total = total_latency.as_secs_f64();
        let per_second = |count: f64| if total > 0.0 { count / total } else { 0.0 };

        let avg_of = |field: fn(&RequestOutcome) -> f64| {
            mean(&outcomes.iter().map(field).collect::<Vec<_>>())
        };
        let avg_latency = avg_of(|o| o.total_latency.as_secs_f64());
        let avg_input_chars = avg_of(|o| o.prompt_char_len as f64);
        let avg_output_chars = avg_of(|o| o.output_char_len as f64);
        let avg_input_tokens = avg_of(|o| o.input_token_count as f64);
        let avg_output_tokens = avg_of(|o| o.output_token_count as f64);

        let requests = prompt_count as f64;
        Self {
            request_rate,
            concurrency,
            total_latency: total,
            request_throughput: per_second(requests),
            avg_latency,
            avg_input_chars,
            avg_output_chars,
            avg_input_tokens,
            avg_output_tokens,
            token_throughput: per_second((avg_input_tokens + avg_output_tokens) * requests),
            failed_requests,
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Request rate: {:.2} requests/s", self.request_rate)?;
        writeln!(f, "Concurrency requests: {}", self.concurrency)?;
        writeln!(f, "Total latency: {:.2} s", self.total_latency)?;
        writeln!(f, "Request throughput: {:.2} requests/s", self.request_throughput)?;
        writeln!(f, "Average latency: {:.2} s", self.avg_latency)?;
        writeln!(f, "Average input len: {:.2} chars", self.avg_input_chars)?;
        writeln!(f, "Average output len: {:.2} chars", self.avg_output_chars)?;
        writeln!(f, "Average input len: {:.2} tokens", self.avg_input_tokens)?;
        writeln!(f, "Average output len: {:.2} tokens", self.avg_output_tokens)?;
        write!(f, "Token throughput: {:.2} tokens/s", self.token_throughput)?;
        if self.failed_requests > 0 {
            write!(f, "\nFailed requests: {}", self.failed_requests)?;
        }
        Ok(())
    }
}

/// Mean, median and 99th percentile of one latency series, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Distribution {
    pub avg: f64,
    pub median: f64,
    pub p99: f64,
}

impl Distribution {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        samples.sort_by(f64::total_cmp);
        Self {
            avg: mean(&samples),
            median: percentile(&samples, 50.0),
            p99: percentile(&samples, 99.0),
        }
    }
}

/// Streaming latency breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamMetrics {
    pub first_token_latency: Distribution,
    pub inter_token_latency: Distribution,
    pub latency_per_output_token: Distribution,
}

impl StreamMetrics {
    pub fn compute(outcomes: &[RequestOutcome]) -> Self {
        let ttft = outcomes
            .iter()
            .map(|o| o.first_token_latency.as_secs_f64())
            .collect();
        let itl = outcomes
            .iter()
            .flat_map(|o| o.inter_token_latencies.iter().map(Duration::as_secs_f64))
            .collect();
        let tpot = outcomes
            .iter()
            .filter_map(RequestOutcome::time_per_output_token)
            .collect();

        Self {
            first_token_latency: Distribution::from_samples(ttft),
            inter_token_latency: Distribution::from_samples(itl),
            latency_per_output_token: Distribution::from_samples(tpot),
        }
    }

    /// Values in report column order.
    pub fn values(&self) -> [f64; 9] {
        let Self {
            first_token_latency: ttft,
            inter_token_latency: itl,
            latency_per_output_token: tpot,
        } = self;
        [
            ttft.avg, ttft.median, ttft.p99, itl.avg, itl.median, itl.p99, tpot.avg, tpot.median,
            tpot.p99,
        ]
    }
}

impl fmt::Display for StreamMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let series = [
            ("TTFT", &self.first_token_latency),
            ("ITL", &self.inter_token_latency),
            ("TPOT", &self.latency_per_output_token),
        ];
        for (i, (name, dist)) in series.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "Average {name}: {:.3} s", dist.avg)?;
            writeln!(f, "Median {name}: {:.3} s", dist.median)?;
            write!(f, "P99 {name}: {:.3} s", dist.p99)?;
        }
        Ok(())
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Percentile of an ascending slice, interpolating linearly between the two
/// closest ranks. Empty input yields 0.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn outcome(total_ms: u64, first_ms: u64, out_tokens: usize, gaps_ms: &[u64]) -> RequestOutcome {
        RequestOutcome {
            prompt_char_len: 10,
            output_char_len: 4,
            input_token_count: 3,
            output_token_count: out_tokens,
            total_latency: Duration::from_millis(total_ms),
            first_token_latency: Duration::from_millis(first_ms),
            inter_token_latencies: gaps_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!(close(percentile(&values, 50.0), 2.5));
        assert!(close(percentile(&values, 99.0), 3.97));
        assert!(close(percentile(&values, 0.0), 1.0));
        assert!(close(percentile(&values, 100.0), 4.0));
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn test_snapshot_throughput_uses_corpus_size() {
        let outcomes = vec![outcome(1_000, 0, 5, &[]), outcome(3_000, 0, 7, &[])];
        let snapshot =
            MetricsSnapshot::compute(2.0, 1, 4, Duration::from_secs(2), &outcomes, 2);

        assert!(close(snapshot.total_latency, 2.0));
        assert!(close(snapshot.request_throughput, 2.0));
        assert!(close(snapshot.avg_latency, 2.0));
        assert!(close(snapshot.avg_output_tokens, 6.0));
        // (3 + 6) tokens * 4 requests / 2 s
        assert!(close(snapshot.token_throughput, 18.0));
        assert_eq!(snapshot.failed_requests, 2);
    }

    #[test]
    fn test_empty_measurement_is_all_zero() {
        let snapshot = MetricsSnapshot::compute(1.0, 1, 0, Duration::ZERO, &[], 0);
        assert_eq!(snapshot.avg_latency, 0.0);
        assert_eq!(snapshot.request_throughput, 0.0);
        assert_eq!(StreamMetrics::compute(&[]), StreamMetrics::default());
    }

    #[test]
    fn test_stream_metrics_flatten_gaps_and_skip_single_token() {
        let outcomes = vec![
            outcome(1_000, 200, 5, &[100, 300]),
            outcome(500, 100, 1, &[]),
            outcome(2_000, 400, 3, &[200]),
        ];
        let stream = StreamMetrics::compute(&outcomes);

        assert!(close(stream.first_token_latency.avg, 0.7 / 3.0));
        assert!(close(stream.first_token_latency.median, 0.2));
        assert!(close(stream.inter_token_latency.avg, 0.2));
        assert!(close(stream.inter_token_latency.median, 0.2));
        // tpot: (1.0 - 0.2) / 4 = 0.2 and (2.0 - 0.4) / 2 = 0.8
        assert!(close(stream.latency_per_output_token.avg, 0.5));
        assert!(close(stream.latency_per_output_token.median, 0.5));
    }

    #[test]
    fn test_display_lists_every_figure() {
        let snapshot = MetricsSnapshot::compute(
            f64::INFINITY,
            2,
            1,
            Duration::from_secs(1),
            &[outcome(1_000, 0, 2, &[])],
            0,
        );
        let text = snapshot.to_string();
        assert!(text.starts_with("Request rate: inf requests/s"));
        assert!(text.contains("Token throughput: 5.00 tokens/s"));
        assert!(!text.contains("Failed"));

        let stream = StreamMetrics::compute(&[outcome(1_000, 250, 2, &[750])]).to_string();
        assert_eq!(stream.lines().count(), 9);
        assert!(stream.contains("Average TTFT: 0.250 s"));
        assert!(stream.contains("P99 ITL: 0.750 s"));
    }

    proptest! {
        #[test]
        fn percentile_stays_within_sample_range(
            mut values in proptest::collection::vec(0.0f64..1_000.0, 1..64),
            pct in 0.0f64..=100.0,
        ) {
            values.sort_by(f64::total_cmp);
            let p = percentile(&values, pct);
            prop_assert!(p >= values[0] - 1e-9);
            prop_assert!(p <= values[values.len() - 1] + 1e-9);
        }
    }
}
