//! Gatehouse - admission control and bulk job orchestration
//!
//! Gatehouse decides, per operation, whether a managed identity may act now,
//! through which proxy, and after how long a pause. Bulk jobs walk a target
//! list one admitted operation at a time and survive restarts.
//!
//! ## Components
//!
//! - **Identity**: health score, risk level, daily quota, cooldown and warming
//! - **Proxy**: endpoint pool with health tracking, selection and probing
//! - **Admission**: risk scoring, delay calculation and outcome recording
//! - **Jobs**: durable bulk jobs driven by a worker pool
//! - **Stats**: rollups across identities, proxies, jobs and workers
//! - **Server**: HTTP API over the engine

pub mod admission;
pub mod clock;
pub mod config;
pub mod engine;
pub mod identity;
pub mod jobs;
pub mod logging;
pub mod persist;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod stats;
pub mod types;

pub use config::{Args, TuningConfig};
pub use engine::Engine;
pub use server::{run, AppState};
pub use types::{GatehouseError, Result};
