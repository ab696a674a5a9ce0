//! Logging infrastructure for Gatehouse
//!
//! Process logs go through `tracing`; the audit module adds a JSONL trail
//! of admission and outcome events.

pub mod audit;

pub use audit::{AuditEvent, AuditEventType, AuditLogger};
