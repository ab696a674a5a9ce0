//! Shared domain types
//!
//! Operation and decision types exchanged between the admission controller,
//! the outcome recorder and the job orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Risk
// ============================================================================

/// Coarse risk classification for an identity or a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify a normalized risk score (0.0 - 1.0)
    pub fn from_score(score: f64) -> Self {
        if score >= 0.75 {
            RiskLevel::Critical
        } else if score >= 0.5 {
            RiskLevel::High
        } else if score >= 0.25 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// One level worse, saturating at critical
    pub fn escalate(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Kind of automated action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Message,
    Join,
    AddMember,
    Extract,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Message => "message",
            OperationType::Join => "join",
            OperationType::AddMember => "add_member",
            OperationType::Extract => "extract",
        }
    }
}

/// Requested pacing for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum SpeedTier {
    Slow,
    #[default]
    Medium,
    Fast,
}

/// A unit (or batch) of work against the external platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Number of targets this operation touches
    #[serde(default = "default_target_count")]
    pub target_count: u32,
    #[serde(default)]
    pub speed_tier: SpeedTier,
    /// Opaque payload carried for logging and risk features
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_info: Option<serde_json::Value>,
}

fn default_target_count() -> u32 {
    1
}

impl Operation {
    pub fn new(op_type: OperationType, speed_tier: SpeedTier) -> Self {
        Self {
            op_type,
            target_count: 1,
            speed_tier,
            target_info: None,
        }
    }

    /// Attach opaque target information
    pub fn with_target_info(mut self, info: serde_json::Value) -> Self {
        self.target_info = Some(info);
        self
    }
}

/// Classification of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    /// Network or timeout; may be retried
    Transient,
    /// The platform rejected the action
    Permanent,
    /// The platform reported a rate or quota limit
    Quota,
    Unknown,
}

/// Outcome of one attempted operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub duration_ms: u64,
    pub response_time_ms: u64,
    #[serde(default)]
    pub error_type: Option<ErrorType>,
}

impl OperationResult {
    pub fn succeeded(duration_ms: u64, response_time_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            response_time_ms,
            error_type: None,
        }
    }

    pub fn failed(error_type: ErrorType, duration_ms: u64) -> Self {
        Self {
            success: false,
            duration_ms,
            response_time_ms: duration_ms,
            error_type: Some(error_type),
        }
    }

    /// Error type of a failure, `Unknown` when the executor did not classify it
    pub fn effective_error(&self) -> Option<ErrorType> {
        if self.success {
            None
        } else {
            Some(self.error_type.unwrap_or(ErrorType::Unknown))
        }
    }
}

// ============================================================================
// Admission decisions
// ============================================================================

/// Reason code attached to every admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Approved,
    IdentityRestricted,
    IdentityCooldown,
    DailyLimitReached,
    NoHealthyProxy,
    RiskTooHigh,
}

/// How the orchestrator must react to a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Proceed with the operation
    Proceed,
    /// Wait and re-check the same target without consuming its retry budget
    Stall,
    /// Back off and re-check, consuming the target's denial budget
    Retry,
    /// Stop the job
    Terminal,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Approved => "approved",
            DecisionReason::IdentityRestricted => "identity_restricted",
            DecisionReason::IdentityCooldown => "identity_cooldown",
            DecisionReason::DailyLimitReached => "daily_limit_reached",
            DecisionReason::NoHealthyProxy => "no_healthy_proxy",
            DecisionReason::RiskTooHigh => "risk_too_high",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            DecisionReason::Approved => Disposition::Proceed,
            DecisionReason::NoHealthyProxy | DecisionReason::IdentityCooldown => Disposition::Stall,
            DecisionReason::RiskTooHigh => Disposition::Retry,
            DecisionReason::IdentityRestricted | DecisionReason::DailyLimitReached => {
                Disposition::Terminal
            }
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory hints attached to approvals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    ReduceSpeed,
    UseSlowerTier,
    RotateProxy,
    ContinueWarming,
    ApproachingDailyLimit,
    WaitForCooldown,
}

/// Inputs that produced a decision, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DecisionSnapshot {
    /// Combined risk score (0.0 - 1.0)
    pub risk_score: f64,
    /// Health of the selected proxy (0.0 - 1.0, 1.0 = healthy)
    pub proxy_health: f64,
    /// 1.0 when the computed delay was not clipped by the ceiling
    pub delay_quality: f64,
    /// Earliest moment a re-check is worthwhile, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check_time: Option<DateTime<Utc>>,
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub approved: bool,
    pub delay_ms: u64,
    /// Confidence in the decision (0.0 - 1.0)
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub reason: DecisionReason,
    pub recommendations: Vec<Recommendation>,
    /// Proxy reserved for this operation (approved decisions only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_endpoint_id: Option<String>,
    pub snapshot: DecisionSnapshot,
}

impl AdmissionDecision {
    /// Build a denial
    pub fn denied(reason: DecisionReason, risk_level: RiskLevel, snapshot: DecisionSnapshot) -> Self {
        Self {
            approved: false,
            delay_ms: 0,
            confidence: 1.0,
            risk_level,
            reason,
            recommendations: Vec::new(),
            proxy_endpoint_id: None,
            snapshot,
        }
    }

    pub fn with_recommendation(mut self, recommendation: Recommendation) -> Self {
        self.recommendations.push(recommendation);
        self
    }
}
