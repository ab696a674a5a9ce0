//! Operation audit log
//!
//! Writes one JSON object per line for every admission denial, recorded
//! outcome and job state change. The log is optional; without a file the
//! logger is a no-op and events only reach `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::types::{AdmissionDecision, Operation, OperationResult};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AdmissionDenied,
    OperationRecorded,
    JobStateChanged,
}

/// One audit log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub identity_id: Option<String>,
    pub job_id: Option<String>,
    pub proxy_endpoint_id: Option<String>,
    /// Reason code, outcome or job status
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            identity_id: None,
            job_id: None,
            proxy_endpoint_id: None,
            detail: None,
            metadata: None,
        }
    }

    pub fn with_identity(mut self, identity_id: &str) -> Self {
        self.identity_id = Some(identity_id.to_string());
        self
    }

    pub fn with_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn with_proxy(mut self, endpoint_id: &str) -> Self {
        self.proxy_endpoint_id = Some(endpoint_id.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// JSONL audit writer
#[derive(Clone, Default)]
pub struct AuditLogger {
    inner: Arc<Mutex<AuditLoggerInner>>,
}

#[derive(Default)]
struct AuditLoggerInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl AuditLogger {
    /// Logger without a sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Start appending to `path`
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut inner = self.inner.lock().await;
        inner.writer = Some(BufWriter::new(file));
        inner.path = Some(path.clone());

        info!("Audit logging initialized to {}", path.display());
        Ok(())
    }

    pub async fn log(&self, event: AuditEvent) {
        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = writeln!(writer, "{}", jsonl) {
                error!("Failed to write audit event: {}", e);
            }
            if let Err(e) = writer.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        }
    }

    pub async fn log_denial(&self, identity_id: &str, job_id: Option<&str>, decision: &AdmissionDecision) {
        let mut event = AuditEvent::new(AuditEventType::AdmissionDenied)
            .with_identity(identity_id)
            .with_detail(decision.reason.as_str())
            .with_metadata(serde_json::json!({
                "risk_score": decision.snapshot.risk_score,
                "risk_level": decision.risk_level,
                "next_check_time": decision.snapshot.next_check_time,
            }));
        if let Some(job_id) = job_id {
            event = event.with_job(job_id);
        }
        self.log(event).await;
    }

    pub async fn log_outcome(
        &self,
        identity_id: &str,
        proxy_endpoint_id: &str,
        operation: &Operation,
        result: &OperationResult,
    ) {
        let detail = if result.success { "success" } else { "failure" };
        let event = AuditEvent::new(AuditEventType::OperationRecorded)
            .with_identity(identity_id)
            .with_proxy(proxy_endpoint_id)
            .with_detail(detail)
            .with_metadata(serde_json::json!({
                "operation": operation.op_type.as_str(),
                "target": operation.target_info,
                "duration_ms": result.duration_ms,
                "response_time_ms": result.response_time_ms,
                "error_type": result.error_type,
            }));
        self.log(event).await;
    }

    pub async fn log_job_state(&self, job_id: &str, identity_id: &str, status: &str) {
        let event = AuditEvent::new(AuditEventType::JobStateChanged)
            .with_job(job_id)
            .with_identity(identity_id)
            .with_detail(status);
        self.log(event).await;
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.inner.lock().await.path.clone()
    }
}
