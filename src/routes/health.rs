//! Liveness endpoint

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub identities: usize,
    pub healthy_proxies: usize,
    pub workers: usize,
    pub timestamp: String,
}

pub fn handle_health(state: &AppState) -> Response<Full<Bytes>> {
    let summary = state.engine.proxies.health_summary();
    let body = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        identities: state.engine.tracker.len(),
        healthy_proxies: summary.healthy,
        workers: state.engine.orchestrator.worker_counters().total(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    json_response(StatusCode::OK, &body)
}
