//! Target batches for recurring jobs

use async_trait::async_trait;

use super::model::BulkJob;
use crate::types::Result;

/// Supplies the next target batch when a recurring job completes
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Targets for the run after `completed`; empty ends the chain
    async fn next_batch(&self, completed: &BulkJob) -> Result<Vec<serde_json::Value>>;
}

/// Re-runs the same target list every time
#[derive(Debug, Default, Clone, Copy)]
pub struct RepeatTargets;

#[async_trait]
impl TargetSource for RepeatTargets {
    async fn next_batch(&self, completed: &BulkJob) -> Result<Vec<serde_json::Value>> {
        Ok(completed.targets.clone())
    }
}
