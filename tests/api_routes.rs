//! HTTP route handler tests
//!
//! Calls the route handlers directly against a wired engine and checks
//! status codes and JSON bodies.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};
use std::sync::Arc;

use gatehouse::clock::SystemClock;
use gatehouse::config::TuningConfig;
use gatehouse::engine::Engine;
use gatehouse::identity::InMemoryIdentityStore;
use gatehouse::jobs::{ExecutionCapability, ExecutionError, ExecutionRequest, ExecutionSuccess, InMemoryJobStore};
use gatehouse::logging::AuditLogger;
use gatehouse::routes;
use gatehouse::server::AppState;

struct AlwaysSucceeds;

#[async_trait]
impl ExecutionCapability for AlwaysSucceeds {
    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionSuccess, ExecutionError> {
        Ok(ExecutionSuccess { response_time_ms: 80 })
    }
}

fn app_state() -> AppState {
    let engine = Engine::new(
        &TuningConfig::default(),
        Arc::new(InMemoryJobStore::new()),
        Arc::new(InMemoryIdentityStore::new()),
        Arc::new(AlwaysSucceeds),
        Arc::new(SystemClock),
        AuditLogger::new(),
    );
    AppState::new(Arc::new(engine))
}

async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_identity_lifecycle() {
    let state = app_state();

    let created = routes::handle_register_identity(&state, br#"{"id": "acct", "daily_limit": 20}"#);
    assert_eq!(created.status(), StatusCode::CREATED);
    let body = body_json(created).await;
    assert_eq!(body["daily_limit"], 20);
    assert_eq!(body["state"], "warming");

    let duplicate = routes::handle_register_identity(&state, br#"{"id": "acct"}"#);
    assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);

    let restricted = routes::handle_restrict_identity(&state, "acct", br#"{"reason": "flagged"}"#);
    assert_eq!(restricted.status(), StatusCode::OK);
    assert_eq!(body_json(restricted).await["state"], "restricted");

    let cleared = routes::handle_unrestrict_identity(&state, "acct");
    assert_eq!(cleared.status(), StatusCode::OK);

    let missing = routes::handle_get_identity(&state, "ghost");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let list = body_json(routes::handle_list_identities(&state)).await;
    assert_eq!(list["count"], 1);
}

#[tokio::test]
async fn test_job_submission_and_lookup() {
    let state = app_state();
    routes::handle_register_identity(&state, br#"{"id": "acct"}"#);

    let submitted = routes::handle_submit_job(
        &state,
        br#"{
            "identity_id": "acct",
            "operation": {"type": "join", "target_count": 2, "speed_tier": "slow"},
            "targets": ["group-a", "group-b"]
        }"#,
    )
    .await;
    assert_eq!(submitted.status(), StatusCode::ACCEPTED);
    let body = body_json(submitted).await;
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let job = routes::handle_get_job(&state, &job_id).await;
    assert_eq!(job.status(), StatusCode::OK);
    let job = body_json(job).await;
    assert_eq!(job["total_targets"], 2);
    assert_eq!(job["operation"]["type"], "join");

    let cancelled = routes::handle_cancel_job(&state, &job_id).await;
    assert_eq!(body_json(cancelled).await["status"], "cancelled");

    let unknown_identity = routes::handle_submit_job(
        &state,
        br#"{"identity_id": "ghost", "operation": {"type": "message", "speed_tier": "fast"}, "targets": []}"#,
    )
    .await;
    assert_eq!(unknown_identity.status(), StatusCode::NOT_FOUND);

    let malformed = routes::handle_submit_job(&state, b"{not json").await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    assert_eq!(
        routes::handle_get_job(&state, "missing").await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_proxy_import_and_stats() {
    let state = app_state();

    let imported = routes::handle_import_proxies(
        &state,
        Some("owner=acct"),
        b"# pool\n10.0.0.1:8080\n10.0.0.2:8080:user:pass\nnot-a-proxy\n",
    );
    assert_eq!(imported.status(), StatusCode::OK);
    let report = body_json(imported).await;
    assert_eq!(report["registered"].as_array().unwrap().len(), 2);
    assert_eq!(report["issues"].as_array().unwrap().len(), 1);

    let listed = body_json(routes::handle_list_proxies(&state)).await;
    assert_eq!(listed["summary"]["total"], 2);
    assert_eq!(listed["proxies"][0]["owner_identity"], "acct");
    assert!(listed["proxies"][0].get("password").is_none());

    let stats = routes::handle_stats(&state).await;
    assert_eq!(stats.status(), StatusCode::OK);
    let stats = body_json(stats).await;
    assert_eq!(stats["proxies"]["healthy"], 2);
    assert_eq!(stats["jobs"]["total"], 0);

    let health = body_json(routes::handle_health(&state)).await;
    assert_eq!(health["healthy"], true);
}
