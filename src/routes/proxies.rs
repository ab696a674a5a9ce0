//! Proxy pool endpoints
//!
//! `POST /api/v1/proxies/import` takes a plain-text or JSON proxy list as
//! the body. `?owner=<identity>` scopes every imported endpoint to one
//! identity.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use super::{error_response, json_response};
use crate::proxy::import_proxies;
use crate::server::AppState;
use crate::types::GatehouseError;

pub fn handle_list_proxies(state: &AppState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "summary": state.engine.proxies.health_summary(),
            "proxies": state.engine.proxies.list(),
        }),
    )
}

pub fn handle_import_proxies(
    state: &AppState,
    query: Option<&str>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let input = match std::str::from_utf8(body) {
        Ok(s) => s,
        Err(_) => {
            return error_response(&GatehouseError::BadRequest(
                "proxy list must be UTF-8 text".into(),
            ))
        }
    };
    let owner = owner_param(query);
    match import_proxies(&state.engine.proxies, input, owner) {
        Ok(report) => json_response(StatusCode::OK, &report),
        Err(e) => error_response(&e),
    }
}

/// Value of the `owner` query parameter, if present and non-empty
fn owner_param(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "owner")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_param() {
        assert_eq!(owner_param(Some("owner=acct-1")), Some("acct-1"));
        assert_eq!(owner_param(Some("x=1&owner=acct-2")), Some("acct-2"));
        assert_eq!(owner_param(Some("owner=")), None);
        assert_eq!(owner_param(None), None);
    }
}
