//! Stub HTTP server and polling helpers shared by integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use tokio::time::{sleep, Instant};

use clientmeter_http::obs::{MeterRegistry, ObservationContext, ObservationHandler};

/// Serve the stub routes on an ephemeral port:
/// `/ok` (100ms delay), `/fast`, `/slow` (5s delay), `/missing` (404).
pub async fn spawn_stub() -> SocketAddr {
    let app = Router::new()
        .route(
            "/ok",
            get(|| async {
                sleep(Duration::from_millis(100)).await;
                "ok"
            }),
        )
        .route("/fast", get(|| async { "fast" }))
        .route(
            "/slow",
            get(|| async {
                sleep(Duration::from_secs(5)).await;
                "slow"
            }),
        )
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "missing") }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Poll `check` every 5ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + within;
    loop {
        if check() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("condition not met within {within:?}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

pub fn active_tasks(registry: &MeterRegistry, uri: &str) -> usize {
    registry
        .find("client.requests.active")
        .tags(&[("uri", uri), ("method", "GET")])
        .long_task_timer()
        .map(|t| t.active_tasks())
        .unwrap_or(0)
}

/// Counts observation starts and stops by name.
#[derive(Default)]
pub struct RecordingHandler {
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.started.lock().unwrap().len(), self.stopped.lock().unwrap().len())
    }
}

impl ObservationHandler for RecordingHandler {
    fn on_start(&self, ctx: &mut ObservationContext) {
        self.started.lock().unwrap().push(ctx.name.clone());
    }

    fn on_stop(&self, ctx: &mut ObservationContext) {
        let outcome = ctx.low_value("outcome").unwrap_or("-").to_string();
        self.stopped.lock().unwrap().push(format!("{} {outcome}", ctx.name));
    }
}
