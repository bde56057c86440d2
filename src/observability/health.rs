//! Health check HTTP server
//!
//! Exposes the bridge's connection state, queue saturation and metrics over
//! HTTP for operators and orchestration platforms.

use crate::observability::metrics::metrics;
use crate::queue::OutboundQueue;
use crate::supervisor::ConnectionState;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    client_id: String,
    port: u16,
    state_rx: watch::Receiver<ConnectionState>,
    queue: Arc<OutboundQueue>,
}

impl HealthServer {
    pub fn new(
        client_id: String,
        port: u16,
        state_rx: watch::Receiver<ConnectionState>,
        queue: Arc<OutboundQueue>,
    ) -> Self {
        Self {
            client_id,
            port,
            state_rx,
            queue,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until the task is dropped or aborted
    pub async fn start(self: Arc<Self>) {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with individual checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async move {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - ready once a broker session is up
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - process liveness
        let live_route = warp::path("live").and(warp::get()).and_then(|| async move {
            Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            }))
        });

        let routes = health_route.or(metrics_route).or(ready_route).or(live_route);

        tracing::info!("Starting health server on port {}", self.port);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    fn is_ready(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    fn health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health());
        checks.insert("queue".to_string(), self.check_queue_health());

        let healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            client_id: self.client_id.clone(),
            checks,
        }
    }

    fn check_mqtt_health(&self) -> HealthCheck {
        let state = *self.state_rx.borrow();
        let (status, message) = match state {
            ConnectionState::Connected => ("healthy", "Broker session established"),
            ConnectionState::Connecting => ("unhealthy", "Broker session being established"),
            ConnectionState::Disconnected => ("unhealthy", "Broker disconnected, retrying"),
        };
        HealthCheck {
            status: status.to_string(),
            message: Some(message.to_string()),
            last_check: current_timestamp(),
        }
    }

    fn check_queue_health(&self) -> HealthCheck {
        let depth = self.queue.depth();
        let capacity = self.queue.capacity();
        let status = if depth >= capacity { "saturated" } else { "healthy" };
        HealthCheck {
            status: status.to_string(),
            message: Some(format!("{depth}/{capacity} messages queued")),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    client_id: String,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
