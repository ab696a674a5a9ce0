//! Core types shared across Gatehouse modules

pub mod error;
pub mod model;

pub use error::{GatehouseError, Result};
pub use model::{
    AdmissionDecision, DecisionReason, DecisionSnapshot, Disposition, ErrorType, Operation,
    OperationResult, OperationType, Recommendation, RiskLevel, SpeedTier,
};
