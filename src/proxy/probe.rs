//! Background proxy health probing
//!
//! Every endpoint, including unhealthy ones, is probed on a fixed interval so
//! that failed endpoints can earn their way back through a success streak.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::pool::{ProxyDescriptor, ProxyOutcome, ProxyPoolManager};

/// Health check capability for a single endpoint
#[async_trait]
pub trait ProxyProber: Send + Sync {
    async fn probe(&self, descriptor: &ProxyDescriptor) -> ProxyOutcome;
}

/// Probes by opening a TCP connection to the proxy under a timeout
#[derive(Debug, Clone)]
pub struct TcpConnectProber {
    timeout: Duration,
}

impl TcpConnectProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProxyProber for TcpConnectProber {
    async fn probe(&self, descriptor: &ProxyDescriptor) -> ProxyOutcome {
        let address = format!("{}:{}", descriptor.host, descriptor.port);
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(_stream)) => ProxyOutcome {
                success: true,
                response_time_ms: elapsed,
            },
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "Proxy probe connect failed");
                ProxyOutcome {
                    success: false,
                    response_time_ms: elapsed,
                }
            }
            Err(_) => {
                debug!(address = %address, "Proxy probe timed out");
                ProxyOutcome {
                    success: false,
                    response_time_ms: self.timeout.as_millis() as u64,
                }
            }
        }
    }
}

/// Probe every endpoint concurrently; returns (successes, failures)
pub async fn probe_all(pool: &ProxyPoolManager, prober: &dyn ProxyProber) -> (usize, usize) {
    let descriptors = pool.descriptors();
    let probes = descriptors.iter().map(|(id, descriptor)| async move {
        (id.clone(), prober.probe(descriptor).await)
    });
    let outcomes = join_all(probes).await;

    let mut success = 0;
    let mut failure = 0;
    for (id, outcome) in outcomes {
        if outcome.success {
            success += 1;
        } else {
            failure += 1;
        }
        // Endpoint may have been unregistered mid-cycle
        if let Err(e) = pool.record_probe(&id, outcome) {
            warn!(endpoint_id = %id, error = %e, "Dropping probe result");
        }
    }

    info!(
        success = success,
        failure = failure,
        "Completed proxy probe cycle"
    );
    (success, failure)
}

/// Spawn the periodic probe loop
pub fn spawn_health_probe_task(
    pool: Arc<ProxyPoolManager>,
    prober: Arc<dyn ProxyProber>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        interval_secs = interval.as_secs(),
        "Proxy health probe task started"
    );

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let _ = probe_all(&pool, prober.as_ref()).await;
        }
    })
}
