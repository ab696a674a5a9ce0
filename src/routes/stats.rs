//! System statistics snapshot

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use super::{error_response, json_response};
use crate::server::AppState;

pub async fn handle_stats(state: &AppState) -> Response<Full<Bytes>> {
    match state.engine.stats.snapshot().await {
        Ok(snapshot) => json_response(StatusCode::OK, &snapshot),
        Err(e) => error_response(&e),
    }
}
