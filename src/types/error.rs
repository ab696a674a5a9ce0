//! Error types for Gatehouse
//!
//! Admission denials are not errors; they are returned as
//! [`AdmissionDecision`](crate::types::AdmissionDecision) values. This enum
//! covers integration faults (unknown ids, storage) and resource exhaustion.

use hyper::StatusCode;

/// Main error type for Gatehouse operations
#[derive(Debug, thiserror::Error)]
pub enum GatehouseError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Proxy pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatehouseError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Execution(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for an unknown identity
    pub fn identity_not_found(identity_id: &str) -> Self {
        Self::NotFound(format!("identity {identity_id}"))
    }

    /// Shorthand for an unknown job
    pub fn job_not_found(job_id: &str) -> Self {
        Self::NotFound(format!("job {job_id}"))
    }

    /// Shorthand for an unknown proxy endpoint
    pub fn proxy_not_found(endpoint_id: &str) -> Self {
        Self::NotFound(format!("proxy endpoint {endpoint_id}"))
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for GatehouseError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GatehouseError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for GatehouseError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("TOML error: {}", err))
    }
}

impl From<hyper::Error> for GatehouseError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

/// Result type alias for Gatehouse operations
pub type Result<T> = std::result::Result<T, GatehouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatehouseError::identity_not_found("a").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatehouseError::PoolExhausted("none".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatehouseError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = GatehouseError::job_not_found("job-1");
        assert_eq!(err.to_string(), "Not found: job job-1");
    }
}
