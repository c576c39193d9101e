use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde_json::json;
use tracing::error;

use crate::server::AppState;

/// How recent a real reading must be for the scale to count as connected.
pub const SCALE_ACTIVITY_WINDOW: Duration = Duration::from_secs(15);

/// Struct for managing server health metrics, including active connections and message counts.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Tracks the number of connected dashboard clients.
    pub connections: IntGauge,
    /// Counts the total number of messages received from clients.
    pub messages_received: IntCounter,
    /// Counts the total number of frames sent to clients.
    pub messages_sent: IntCounter,
    /// Counts readings and sentinels taken off the outbound queue.
    pub readings_broadcast: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl HealthMetrics {
    /// Creates a new instance of `HealthMetrics` and registers the metrics with Prometheus.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Connected dashboard clients")?;
        let messages_received = IntCounter::new("messages_received", "Total messages received")?;
        let messages_sent = IntCounter::new("messages_sent", "Total messages sent")?;
        let readings_broadcast = IntCounter::new("readings_broadcast", "Total readings broadcast")?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(readings_broadcast.clone()))?;

        Ok(Self {
            connections,
            messages_received,
            messages_sent,
            readings_broadcast,
            registry,
        })
    }

    /// Exposes the current state of all registered metrics in Prometheus-compatible format.
    pub fn expose_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Time of the last real weight seen by the broadcaster.
#[derive(Debug, Default)]
pub struct ScaleActivity {
    last: Mutex<Option<Instant>>,
}

impl ScaleActivity {
    pub fn record(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Whether a reading was seen within [`SCALE_ACTIVITY_WINDOW`].
    pub fn connected(&self) -> bool {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|t| t.elapsed() < SCALE_ACTIVITY_WINDOW)
    }
}

/// `GET /ping`: liveness probe.
pub async fn ping() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        "pong",
    )
}

/// `GET /health`: scale, build and uptime summary.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.config.get();
    let body = json!({
        "status": "ok",
        "scale": {
            "connected": snapshot.test_mode || state.activity.connected(),
            "port": snapshot.port,
            "brand": snapshot.brand,
            "test_mode": snapshot.test_mode,
        },
        "build": {
            "env": state.env.name,
            "date": state.build.build_date,
            "time": state.build.build_time,
        },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(body))
}

/// `GET /metrics`: Prometheus scrape endpoint.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.expose_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
