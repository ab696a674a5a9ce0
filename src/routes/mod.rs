//! HTTP routes for Gatehouse

pub mod health;
pub mod identities;
pub mod jobs;
pub mod proxies;
pub mod stats;

pub use health::handle_health;
pub use identities::{
    handle_get_identity, handle_list_identities, handle_register_identity,
    handle_restrict_identity, handle_unrestrict_identity,
};
pub use jobs::{handle_cancel_job, handle_get_job, handle_list_jobs, handle_submit_job};
pub use proxies::{handle_import_proxies, handle_list_proxies};
pub use stats::handle_stats;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::types::GatehouseError;

/// Serialize `body` as a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(json) => with_status(status, Full::new(Bytes::from(json))),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            with_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                Full::new(Bytes::from_static(br#"{"error":"serialization failed"}"#)),
            )
        }
    }
}

/// JSON error body with the status derived from the error
pub fn error_response(err: &GatehouseError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    json_response(
        status,
        &serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": err.to_string(),
        }),
    )
}

pub fn not_found(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({ "error": "Not Found", "path": path }),
    )
}

/// Decode a JSON request body
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, GatehouseError> {
    if body.is_empty() {
        return Err(GatehouseError::BadRequest("request body is required".into()));
    }
    Ok(serde_json::from_slice(body)?)
}

fn with_status(status: StatusCode, body: Full<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
