//! Prometheus metrics for Shardcache
//!
//! Exposes metrics at `/metrics` endpoint in Prometheus format.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{debug, warn};

/// Metric names
pub mod names {
    pub const REQUESTS_TOTAL: &str = "shardcache_requests_total";
    pub const RESPONSE_TIME_SECONDS: &str = "shardcache_response_time_seconds";
    pub const UPTIME_SECONDS: &str = "shardcache_uptime_seconds";
    pub const INFO: &str = "shardcache_info";
}

/// Which side of the cluster a server plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Auxiliary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Auxiliary => "auxiliary",
        }
    }
}

/// Metrics recorder
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
    role: Role,
    start_time: Instant,
}

impl MetricsRecorder {
    /// Install the process-wide Prometheus recorder. If one is already
    /// installed, the returned recorder renders from a private registry.
    pub fn new(role: Role) -> Self {
        let handle = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                return Self::detached(role);
            }
        };

        gauge!(names::INFO, "version" => shardcache_core::VERSION, "role" => role.as_str())
            .set(1.0);

        Self {
            handle,
            role,
            start_time: Instant::now(),
        }
    }

    /// A recorder that is not installed globally
    pub fn detached(role: Role) -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
            role,
            start_time: Instant::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Get metrics output in Prometheus format
    pub fn render(&self) -> String {
        gauge!(names::UPTIME_SECONDS).set(self.start_time.elapsed().as_secs_f64());
        self.handle.render()
    }

    /// Record one handled request
    pub fn record_request(&self, method: &str, status: u16, duration_secs: f64) {
        counter!(
            names::REQUESTS_TOTAL,
            "role" => self.role.as_str(),
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            names::RESPONSE_TIME_SECONDS,
            "role" => self.role.as_str(),
            "method" => method.to_string()
        )
        .record(duration_secs);
    }
}

/// Axum middleware for recording request metrics
pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsRecorder>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    metrics.record_request(&method, status, duration);

    debug!(
        role = metrics.role().as_str(),
        method = %method,
        path = %path,
        status = %status,
        duration_ms = %(duration * 1000.0),
        "Request completed"
    );

    response
}

/// Handler for /metrics endpoint
pub async fn metrics_handler(State(metrics): State<Arc<MetricsRecorder>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render(),
    )
}
