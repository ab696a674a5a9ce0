//! External execution capability
//!
//! The transport that talks to the external platform is a collaborator. The
//! orchestrator only sees [`ExecutionCapability`]; [`HttpExecutor`] forwards
//! each unit operation to a transport service over HTTP.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::proxy::ProxyDescriptor;
use crate::types::{ErrorType, GatehouseError, Operation, Result};

/// One unit operation handed to the transport
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub identity_id: String,
    pub proxy_endpoint_id: String,
    /// Connection details of the reserved proxy, when still registered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyDescriptor>,
    pub operation: Operation,
}

/// Successful execution report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSuccess {
    /// Platform response latency, when the transport reports it
    pub response_time_ms: u64,
}

/// Classified execution failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} execution failure: {message}")]
pub struct ExecutionError {
    pub kind: ErrorType,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Permanent, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Quota, message)
    }
}

/// "Perform operation X for identity Y through proxy Z"
#[async_trait]
pub trait ExecutionCapability: Send + Sync {
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionSuccess, ExecutionError>;
}

// ============================================================================
// HTTP transport
// ============================================================================

/// Forwards operations as JSON POSTs to `{base_url}/execute`
pub struct HttpExecutor {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatehouseError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            endpoint: format!("{}/execute", base_url.trim_end_matches('/')),
            client,
        })
    }
}

/// Map a transport response status to an outcome class
pub fn classify_status(status: StatusCode) -> Option<ErrorType> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(ErrorType::Quota)
    } else if status == StatusCode::REQUEST_TIMEOUT {
        Some(ErrorType::Transient)
    } else if status.is_client_error() {
        Some(ErrorType::Permanent)
    } else if status.is_server_error() {
        Some(ErrorType::Transient)
    } else {
        Some(ErrorType::Unknown)
    }
}

#[async_trait]
impl ExecutionCapability for HttpExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionSuccess, ExecutionError> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ExecutionError::transient(e.to_string())
                } else {
                    ExecutionError::new(ErrorType::Unknown, e.to_string())
                }
            })?;
        let elapsed = started.elapsed().as_millis() as u64;
        let status = response.status();

        debug!(
            identity_id = %request.identity_id,
            job_id = %request.job_id,
            status = status.as_u16(),
            elapsed_ms = elapsed,
            "Transport responded"
        );

        match classify_status(status) {
            None => {
                let reported = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("response_time_ms")?.as_u64());
                Ok(ExecutionSuccess {
                    response_time_ms: reported.unwrap_or(elapsed),
                })
            }
            Some(kind) => {
                let body = response.text().await.unwrap_or_default();
                Err(ExecutionError::new(kind, format!("HTTP {}: {}", status.as_u16(), body)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationType, SpeedTier};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), Some(ErrorType::Quota));
        assert_eq!(classify_status(StatusCode::FORBIDDEN), Some(ErrorType::Permanent));
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Some(ErrorType::Transient));
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), Some(ErrorType::Transient));
    }

    async fn one_shot_server(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            job_id: "job-1".into(),
            identity_id: "acct".into(),
            proxy_endpoint_id: "http://10.0.0.1:8080".into(),
            proxy: None,
            operation: Operation::new(OperationType::Message, SpeedTier::Fast),
        }
    }

    #[tokio::test]
    async fn test_http_executor_maps_quota() {
        let base = one_shot_server(
            "HTTP/1.1 429 Too Many Requests\r\ncontent-length: 7\r\nconnection: close\r\n\r\nslow it",
        )
        .await;
        let executor = HttpExecutor::new(&base, Duration::from_secs(5)).unwrap();

        let err = executor.execute(&request()).await.unwrap_err();
        assert_eq!(err.kind, ErrorType::Quota);
        assert!(err.message.contains("429"));
    }

    #[tokio::test]
    async fn test_http_executor_success_reads_latency() {
        let base = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 24\r\nconnection: close\r\n\r\n{\"response_time_ms\": 42}",
        )
        .await;
        let executor = HttpExecutor::new(&base, Duration::from_secs(5)).unwrap();

        let ok = executor.execute(&request()).await.unwrap();
        assert_eq!(ok.response_time_ms, 42);
    }

    #[tokio::test]
    async fn test_http_executor_connect_failure_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let executor = HttpExecutor::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let err = executor.execute(&request()).await.unwrap_err();
        assert_eq!(err.kind, ErrorType::Transient);
    }
}
