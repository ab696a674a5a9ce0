//! Bulk job orchestration
//!
//! - **model**: durable job records
//! - **store**: job persistence
//! - **orchestrator**: the per-target admission / execution / feedback loop
//! - **worker**: fixed worker pool sharing one job queue
//! - **execution**: the external execution capability
//! - **targets**: target batches for recurring jobs

pub mod execution;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod targets;
pub mod worker;

pub use execution::{
    classify_status, ExecutionCapability, ExecutionError, ExecutionRequest, ExecutionSuccess,
    HttpExecutor,
};
pub use model::{
    AttemptOutcome, BulkJob, InFlightAttempt, JobResult, JobStatus, JobSubmission, Recurrence,
};
pub use orchestrator::{JobOrchestrator, OrchestratorTuning};
pub use store::{FileJobStore, InMemoryJobStore, JobStore};
pub use targets::{RepeatTargets, TargetSource};
pub use worker::{WorkerCounters, WorkerPool};
