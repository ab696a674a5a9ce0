//! Admission and feedback
//!
//! - **delay**: pure delay computation
//! - **controller**: per-operation approve/deny gate
//! - **recorder**: outcome feedback into identity and proxy state

pub mod controller;
pub mod delay;
pub mod recorder;

pub use controller::{AdmissionController, AdmissionTuning, FixedLoad, LoadSource};
pub use delay::{DelayCalculator, DelayComputation, DelayInputs, DelayTuning};
pub use recorder::{OutcomeRecorder, RecordedOutcome};
