//! Proxy endpoint pool
//!
//! - **pool**: health tracking and selection
//! - **probe**: periodic background health probing
//! - **import**: endpoint list parsing and registration

pub mod import;
pub mod pool;
pub mod probe;

pub use import::{import_proxies, parse_proxy_list, ImportIssue, ImportReport};
pub use pool::{
    HealthStatus, ProxyCriteria, ProxyDescriptor, ProxyEndpoint, ProxyHealthSummary, ProxyLease,
    ProxyOutcome, ProxyPoolManager, ProxyProtocol, ProxyTuning, ProxyView, SelectionStrategy,
};
pub use probe::{probe_all, spawn_health_probe_task, ProxyProber, TcpConnectProber};
