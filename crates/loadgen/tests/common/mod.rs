#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use servebench_loadgen::{BackendKind, BenchConfig, RetryLimit};
use tokio::sync::oneshot;
use tokio::time::sleep;

/// What the mock endpoint sends back for one request.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: StatusCode,
    /// Sent in order, each as its own body chunk.
    pub chunks: Vec<Vec<u8>>,
    /// Pause before the first chunk and between chunks.
    pub gap: Duration,
    /// Time the request counts as in flight before the body starts.
    pub hold: Duration,
}

impl MockReply {
    pub fn json(value: Value) -> Self {
        Self {
            status: StatusCode::OK,
            chunks: vec![value.to_string().into_bytes()],
            gap: Duration::ZERO,
            hold: Duration::ZERO,
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            chunks: vec![b"overloaded".to_vec()],
            gap: Duration::ZERO,
            hold: Duration::ZERO,
        }
    }

    pub fn chunked(chunks: Vec<Vec<u8>>, gap: Duration) -> Self {
        Self {
            status: StatusCode::OK,
            chunks,
            gap,
            hold: Duration::ZERO,
        }
    }

    pub fn held(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }
}

type Script = Arc<dyn Fn(usize, &Value) -> MockReply + Send + Sync>;

#[derive(Clone)]
struct MockState {
    script: Script,
    hits: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

/// In-process text-generation endpoint answering from a script.
pub struct MockEndpoint {
    addr: SocketAddr,
    state: MockState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockEndpoint {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(usize, &Value) -> MockReply + Send + Sync + 'static,
    {
        let state = MockState {
            script: Arc::new(script),
            hits: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock endpoint");
        let addr = listener.local_addr().expect("mock endpoint addr");

        let app = Router::new()
            .route("/generate", post(generate))
            .route("/v1/chat", post(generate))
            .route("/v2/models/ensemble/generate", post(generate))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.state.bodies.lock().clone()
    }

    /// Configuration pointing at this endpoint with progress output off.
    pub fn config(&self, backend: BackendKind, stream: bool) -> BenchConfig {
        let mut config = BenchConfig::default();
        config.endpoint.host = self.addr.ip().to_string();
        config.endpoint.port = self.addr.port();
        config.endpoint.backend = backend;
        config.endpoint.timeout_secs = 10;
        config.endpoint.max_retries = RetryLimit::Limited(4);
        config.load.stream = stream;
        config.load.progress = false;
        config
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn generate(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(current, Ordering::SeqCst);
    state.bodies.lock().push(body.clone());

    let reply = (state.script)(hit, &body);
    if !reply.hold.is_zero() {
        sleep(reply.hold).await;
    }
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let gap = reply.gap;
    let chunks = futures::stream::iter(reply.chunks).then(move |chunk| async move {
        if !gap.is_zero() {
            sleep(gap).await;
        }
        Ok::<_, Infallible>(Bytes::from(chunk))
    });
    (reply.status, Body::from_stream(chunks)).into_response()
}
