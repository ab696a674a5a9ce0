//! HTTP server implementation
//!
//! hyper http1 with TokioIo, one task per connection. Routing is a match on
//! method and path segments under `/api/v1`.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::routes;
use crate::types::{GatehouseError, Result};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared application state
pub struct AppState {
    pub engine: Arc<Engine>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }
}

/// Accept connections until the listener fails
pub async fn run(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(listen = %addr, "Gatehouse listening");

    loop {
        let (stream, remote) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { handle_request(state, remote, req).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(remote = %remote, error = %e, "Connection closed with error");
            }
        });
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    debug!(remote = %addr, method = %method, path = %path, "Request");

    let body = if method == Method::POST {
        match read_body(req).await {
            Ok(body) => body,
            Err(e) => return Ok(to_boxed(routes::error_response(&e))),
        }
    } else {
        Bytes::new()
    };

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let state = state.as_ref();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"] | ["healthz"]) => routes::handle_health(state),

        (&Method::POST, ["api", "v1", "jobs"]) => routes::handle_submit_job(state, &body).await,
        (&Method::GET, ["api", "v1", "jobs"]) => routes::handle_list_jobs(state).await,
        (&Method::GET, ["api", "v1", "jobs", id]) => routes::handle_get_job(state, id).await,
        (&Method::POST, ["api", "v1", "jobs", id, "cancel"]) => {
            routes::handle_cancel_job(state, id).await
        }

        (&Method::GET, ["api", "v1", "identities"]) => routes::handle_list_identities(state),
        (&Method::POST, ["api", "v1", "identities"]) => {
            routes::handle_register_identity(state, &body)
        }
        (&Method::GET, ["api", "v1", "identities", id]) => routes::handle_get_identity(state, id),
        (&Method::POST, ["api", "v1", "identities", id, "restrict"]) => {
            routes::handle_restrict_identity(state, id, &body)
        }
        (&Method::POST, ["api", "v1", "identities", id, "unrestrict"]) => {
            routes::handle_unrestrict_identity(state, id)
        }

        (&Method::GET, ["api", "v1", "proxies"]) => routes::handle_list_proxies(state),
        (&Method::POST, ["api", "v1", "proxies", "import"]) => {
            routes::handle_import_proxies(state, query.as_deref(), &body)
        }

        (&Method::GET, ["api", "v1", "stats"]) => routes::handle_stats(state).await,

        _ => routes::not_found(&path),
    };

    Ok(to_boxed(response))
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes> {
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            Err(GatehouseError::BadRequest(format!("unreadable request body: {e}")))
        }
    }
}

fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
