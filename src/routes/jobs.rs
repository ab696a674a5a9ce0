//! Bulk job endpoints
//!
//! - `POST /api/v1/jobs` - submit a job, returns 202 with its id
//! - `GET /api/v1/jobs` - list jobs
//! - `GET /api/v1/jobs/{id}` - job status
//! - `POST /api/v1/jobs/{id}/cancel` - cancel a job

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{error_response, json_response, parse_json};
use crate::jobs::{BulkJob, JobResult, JobStatus, JobSubmission, Recurrence};
use crate::server::AppState;
use crate::types::Operation;

/// Job record without its target payloads
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub identity_id: String,
    pub operation: Operation,
    pub status: JobStatus,
    pub progress: u8,
    pub result: JobResult,
    pub total_targets: usize,
    pub cursor: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_job_id: Option<String>,
    pub total_attempts: u64,
    pub total_delay_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<BulkJob> for JobView {
    fn from(job: BulkJob) -> Self {
        Self {
            total_targets: job.targets.len(),
            id: job.id,
            identity_id: job.identity_id,
            operation: job.operation,
            status: job.status,
            progress: job.progress,
            result: job.result,
            cursor: job.cursor,
            failure_reason: job.failure_reason,
            recurrence: job.recurrence,
            parent_job_id: job.parent_job_id,
            child_job_id: job.child_job_id,
            total_attempts: job.total_attempts,
            total_delay_ms: job.total_delay_ms,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: String,
    status: JobStatus,
}

pub async fn handle_submit_job(state: &AppState, body: &[u8]) -> Response<Full<Bytes>> {
    let submission: JobSubmission = match parse_json(body) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match state.engine.orchestrator.submit(submission).await {
        Ok(job_id) => json_response(
            StatusCode::ACCEPTED,
            &SubmitResponse {
                job_id,
                status: JobStatus::Queued,
            },
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_list_jobs(state: &AppState) -> Response<Full<Bytes>> {
    match state.engine.orchestrator.list().await {
        Ok(jobs) => {
            let jobs: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "count": jobs.len(), "jobs": jobs }),
            )
        }
        Err(e) => error_response(&e),
    }
}

pub async fn handle_get_job(state: &AppState, job_id: &str) -> Response<Full<Bytes>> {
    match state.engine.orchestrator.get_status(job_id).await {
        Ok(job) => json_response(StatusCode::OK, &JobView::from(job)),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_cancel_job(state: &AppState, job_id: &str) -> Response<Full<Bytes>> {
    match state.engine.orchestrator.cancel(job_id).await {
        Ok(job) => json_response(StatusCode::OK, &JobView::from(job)),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobSubmission;
    use crate::types::{OperationType, SpeedTier};

    #[test]
    fn test_view_omits_targets() {
        let submission = JobSubmission::new(
            "acct",
            Operation::new(OperationType::Message, SpeedTier::Fast),
            vec![serde_json::json!({"user": "a"}), serde_json::json!({"user": "b"})],
        );
        let view = JobView::from(BulkJob::from_submission(submission, Utc::now()));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["total_targets"], 2);
        assert!(json.get("targets").is_none());
        assert_eq!(json["status"], "queued");
    }
}
