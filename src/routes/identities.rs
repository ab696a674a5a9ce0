//! Managed identity administration
//!
//! - `GET /api/v1/identities` - list with effective state
//! - `POST /api/v1/identities` - register
//! - `GET /api/v1/identities/{id}` - status
//! - `POST /api/v1/identities/{id}/restrict` - manual restriction
//! - `POST /api/v1/identities/{id}/unrestrict` - clear a restriction

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;

use super::{error_response, json_response, parse_json};
use crate::identity::NewIdentity;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct RestrictRequest {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "manual".to_string()
}

pub fn handle_list_identities(state: &AppState) -> Response<Full<Bytes>> {
    let identities = state.engine.tracker.list();
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "count": identities.len(),
            "states": state.engine.tracker.state_counts(),
            "identities": identities,
        }),
    )
}

pub fn handle_register_identity(state: &AppState, body: &[u8]) -> Response<Full<Bytes>> {
    let request: NewIdentity = match parse_json(body) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    match state.engine.tracker.register(request) {
        Ok(status) => json_response(StatusCode::CREATED, &status),
        Err(e) => error_response(&e),
    }
}

pub fn handle_get_identity(state: &AppState, identity_id: &str) -> Response<Full<Bytes>> {
    match state.engine.tracker.get_status(identity_id) {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => error_response(&e),
    }
}

pub fn handle_restrict_identity(
    state: &AppState,
    identity_id: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    // Reason is optional; an empty body restricts with "manual"
    let request = if body.is_empty() {
        RestrictRequest {
            reason: default_reason(),
        }
    } else {
        match parse_json::<RestrictRequest>(body) {
            Ok(r) => r,
            Err(e) => return error_response(&e),
        }
    };
    match state.engine.tracker.restrict(identity_id, request.reason) {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => error_response(&e),
    }
}

pub fn handle_unrestrict_identity(state: &AppState, identity_id: &str) -> Response<Full<Bytes>> {
    match state.engine.tracker.clear_restriction(identity_id) {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => error_response(&e),
    }
}
