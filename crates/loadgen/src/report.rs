//! CSV outputs of a campaign.

use std::path::Path;

use tracing::info;

use crate::campaign::TrialReport;
use crate::error::Result;

const END_OF_SEQUENCE: &str = "</s>";

const PERF_HEADER: [&str; 10] = [
    "Request rate",
    "Concurrency",
    "Total latency",
    "Request throughput",
    "Avg latency",
    "Avg input chars",
    "Avg output chars",
    "Avg input tokens",
    "Avg output tokens",
    "Token throughput",
];

const STREAM_HEADER: [&str; 9] = [
    "Avg TTFT",
    "Median TTFT",
    "P99 TTFT",
    "Avg ITL",
    "Median ITL",
    "P99 ITL",
    "Avg TPOT",
    "Median TPOT",
    "P99 TPOT",
];

/// One row per generated text, single column.
pub fn write_outputs(path: &Path, results: &[String]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for text in results {
        writer.write_record([text.replace(END_OF_SEQUENCE, "")])?;
    }
    writer.flush()?;
    info!(path = %path.display(), rows = results.len(), "wrote generated outputs");
    Ok(())
}

/// One row per trial; streaming columns are appended when `stream` is set.
pub fn write_perf(path: &Path, trials: &[TrialReport], stream: bool) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header: Vec<&str> = PERF_HEADER.to_vec();
    if stream {
        header.extend(STREAM_HEADER);
    }
    writer.write_record(&header)?;

    for trial in trials {
        let m = &trial.metrics;
        let mut row: Vec<String> = [
            m.request_rate,
            m.concurrency as f64,
            m.total_latency,
            m.request_throughput,
            m.avg_latency,
            m.avg_input_chars,
            m.avg_output_chars,
            m.avg_input_tokens,
            m.avg_output_tokens,
            m.token_throughput,
        ]
        .iter()
        .map(|value| format!("{value:.2}"))
        .collect();

        if stream {
            let values = trial.stream.unwrap_or_default().values();
            row.extend(values.iter().map(|value| format!("{value:.3}")));
        }
        writer.write_record(&row)?;
    }

    writer.flush()?;
    info!(path = %path.display(), trials = trials.len(), "wrote performance report");
    Ok(())
}
