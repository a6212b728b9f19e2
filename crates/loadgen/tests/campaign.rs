mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use common::{MockEndpoint, MockReply};
use serde_json::json;
use servebench_loadgen::{
    BackendKind, Campaign, ExecutionMode, LatencyRecorder, ModelType, Prompt, RequestExecutor,
    RetryLimit, RoundDriver, RoundRunner, StopReason,
};

fn prompts(raw: &[&str]) -> Vec<Prompt> {
    let raw: Vec<String> = raw.iter().map(|s| s.to_string()).collect();
    ModelType::Empty.format_corpus(&raw)
}

/// Replies with the upper-cased prompt so results can be matched to inputs.
fn echo(_: usize, body: &serde_json::Value) -> MockReply {
    let prompt = body["prompt"].as_str().unwrap_or_default().to_uppercase();
    MockReply::json(json!({ "texts": [prompt] }))
}

#[tokio::test]
async fn test_end_to_end_burst_campaign() {
    let endpoint = MockEndpoint::start(|_, _| MockReply::json(json!({ "texts": ["X"] }))).await;
    let config = endpoint.config(BackendKind::Ksana, false);
    config.validate().unwrap();

    let executor = Arc::new(RequestExecutor::from_config(&config).unwrap());
    let mut runner = RoundRunner::from_config(&config, executor, prompts(&["a", "b"]));
    let campaign = Campaign::new(config.search_policy(2), config.measurement_plan());
    let report = campaign.run(&mut runner).await.unwrap();

    assert_eq!(report.results, vec!["X".to_string(), "X".to_string()]);
    assert_eq!(report.trials.len(), 1);
    assert_eq!(report.stop, StopReason::Unconstrained);
    let metrics = &report.trials[0].metrics;
    assert!(metrics.request_rate.is_infinite());
    assert_eq!(metrics.concurrency, 1);
    assert_eq!(metrics.failed_requests, 0);
    assert_eq!(metrics.avg_output_chars, 1.0);
    assert!(metrics.total_latency > 0.0);
    assert!((metrics.request_throughput - 2.0 / metrics.total_latency).abs() < 1e-9);
    assert_eq!(endpoint.hits(), 2);
}

#[tokio::test]
async fn test_results_follow_prompt_order() {
    let endpoint = MockEndpoint::start(|hit, body| {
        // later requests answer faster so completion order differs from input order
        let hold = 3u64.saturating_sub(hit as u64) * 100;
        echo(hit, body).held(Duration::from_millis(hold))
    })
    .await;
    let config = endpoint.config(BackendKind::Ksana, false);
    let executor = Arc::new(RequestExecutor::from_config(&config).unwrap());
    let mut runner = RoundRunner::new(executor, prompts(&["a", "b", "c"]), 3);

    let recorder = LatencyRecorder::new();
    let output = runner.run_round(f64::INFINITY, &recorder).await.unwrap();

    assert_eq!(output.results, vec!["A", "B", "C"]);
    assert_eq!(output.failed, 0);
    assert_eq!(recorder.len(), 3);
    assert_eq!(endpoint.max_in_flight(), 3);
}

#[tokio::test]
async fn test_sync_mode_keeps_one_request_in_flight() {
    let endpoint =
        MockEndpoint::start(|hit, body| echo(hit, body).held(Duration::from_millis(20))).await;
    let config = endpoint.config(BackendKind::Ksana, false);
    let executor = Arc::new(RequestExecutor::from_config(&config).unwrap());
    let mut runner =
        RoundRunner::new(executor, prompts(&["a", "b", "c", "d"]), 4).with_mode(ExecutionMode::Sync);

    let output = runner
        .run_round(f64::INFINITY, &LatencyRecorder::new())
        .await
        .unwrap();

    assert_eq!(output.results, vec!["A", "B", "C", "D"]);
    assert_eq!(endpoint.max_in_flight(), 1);
}

#[tokio::test]
async fn test_finite_rate_paces_batches() {
    let endpoint = MockEndpoint::start(echo).await;
    let config = endpoint.config(BackendKind::Ksana, false);
    let executor = Arc::new(RequestExecutor::from_config(&config).unwrap());
    let mut runner = RoundRunner::new(executor, prompts(&["a", "b", "c", "d", "e", "f"]), 2);

    // three batches of two, 2 / 10 = 0.2s apart
    let started = Instant::now();
    let output = runner
        .run_round(10.0, &LatencyRecorder::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(output.elapsed >= Duration::from_millis(400));
    assert_eq!(output.results.len(), 6);
}

#[tokio::test]
async fn test_failed_requests_leave_empty_slots() {
    let endpoint = MockEndpoint::start(|hit, body| {
        if body["prompt"] == "bad" {
            MockReply::status(StatusCode::INTERNAL_SERVER_ERROR)
        } else {
            echo(hit, body)
        }
    })
    .await;
    let mut config = endpoint.config(BackendKind::Ksana, false);
    config.endpoint.max_retries = RetryLimit::Limited(1);
    let executor = Arc::new(RequestExecutor::from_config(&config).unwrap());
    let mut runner = RoundRunner::from_config(&config, executor, prompts(&["ok", "bad", "fine"]));
    let campaign = Campaign::new(config.search_policy(3), config.measurement_plan());

    let report = campaign.run(&mut runner).await.unwrap();

    assert_eq!(report.results, vec!["OK", "", "FINE"]);
    let metrics = &report.trials[0].metrics;
    assert_eq!(metrics.failed_requests, 1);
    // one failed request makes two attempts
    assert_eq!(endpoint.hits(), 4);
}

#[tokio::test]
async fn test_latency_bound_drives_rate_search() {
    let endpoint = MockEndpoint::start(echo).await;
    let mut config = endpoint.config(BackendKind::Ksana, false);
    config.load.request_rate = 1.0;
    config.load.concurrency = 2;
    config.search.max_avg_latency = Some(60.0);
    let executor = Arc::new(RequestExecutor::from_config(&config).unwrap());
    let mut runner = RoundRunner::from_config(&config, executor, prompts(&["a", "b"]));
    let campaign = Campaign::new(config.search_policy(2), config.measurement_plan());

    let report = campaign.run(&mut runner).await.unwrap();

    // every trial satisfies the bound: 1.0 doubles to the corpus cap of 2.0,
    // which is then proposed again
    let rates: Vec<f64> = report.trials.iter().map(|t| t.metrics.request_rate).collect();
    assert_eq!(rates, vec![1.0, 2.0]);
    assert_eq!(report.stop, StopReason::DuplicateRate(2.0));
}
