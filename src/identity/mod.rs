//! Managed identity health tracking
//!
//! The tracker is the sole owner of identity risk fields. Reads go through
//! [`IdentityHealthTracker::get_status`]; outcome-driven writes go through
//! the outcome recorder.

pub mod store;
pub mod tracker;

pub use store::{FileIdentityStore, IdentityStore, InMemoryIdentityStore};
pub use tracker::{
    ErrorSeverity, IdentityHealthTracker, IdentityState, IdentityStatus, IdentityTuning,
    ManagedIdentity, NewIdentity, StateCounts,
};
