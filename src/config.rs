//! Configuration for Gatehouse
//!
//! Process settings come from CLI arguments and environment variables
//! (clap). Risk weights, thresholds and retry bounds live in an optional
//! TOML tuning file; every value has a default.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::admission::{AdmissionTuning, DelayTuning};
use crate::identity::IdentityTuning;
use crate::jobs::OrchestratorTuning;
use crate::proxy::ProxyTuning;
use crate::types::{GatehouseError, Result};

/// Gatehouse - admission control and bulk job orchestration for managed identities
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse")]
#[command(about = "Risk-adaptive admission control and bulk job orchestration")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Directory for job records and identity/proxy snapshots
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Number of job worker tasks
    #[arg(long, env = "WORKER_COUNT", default_value = "4")]
    pub worker_count: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// TOML file with risk and throttling tunables
    #[arg(long, env = "TUNING_FILE")]
    pub tuning_file: Option<PathBuf>,

    /// JSON file of identities to register at startup
    #[arg(long, env = "IDENTITY_FILE")]
    pub identity_file: Option<PathBuf>,

    /// Proxy list to import at startup (JSON array or one endpoint per line)
    #[arg(long, env = "PROXY_FILE")]
    pub proxy_file: Option<PathBuf>,

    /// Base URL of the transport service that executes operations
    #[arg(long, env = "EXECUTOR_URL", default_value = "http://localhost:8095")]
    pub executor_url: String,

    /// Execution call timeout in milliseconds
    #[arg(long, env = "EXECUTION_TIMEOUT_MS", default_value = "30000")]
    pub execution_timeout_ms: u64,

    /// Interval between proxy health probe cycles (0 disables probing)
    #[arg(long, env = "PROBE_INTERVAL_SECS", default_value = "60")]
    pub probe_interval_secs: u64,

    /// Per-endpoint probe timeout in milliseconds
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value = "5000")]
    pub probe_timeout_ms: u64,

    /// Interval between identity/proxy snapshots to DATA_DIR
    #[arg(long, env = "SNAPSHOT_INTERVAL_SECS", default_value = "30")]
    pub snapshot_interval_secs: u64,

    /// Append audit events (JSONL) to this file
    #[arg(long, env = "AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,
}

impl Args {
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    /// Per-identity records written on every recorded outcome
    pub fn identities_dir(&self) -> PathBuf {
        self.data_dir.join("identities")
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.worker_count == 0 {
            return Err("WORKER_COUNT must be at least 1".to_string());
        }
        if !matches!(self.log_format.to_ascii_lowercase().as_str(), "text" | "json") {
            return Err("LOG_FORMAT must be 'text' or 'json'".to_string());
        }
        if self.execution_timeout_ms == 0 {
            return Err("EXECUTION_TIMEOUT_MS must be positive".to_string());
        }
        if self.probe_timeout_ms == 0 {
            return Err("PROBE_TIMEOUT_MS must be positive".to_string());
        }
        if self.snapshot_interval_secs == 0 {
            return Err("SNAPSHOT_INTERVAL_SECS must be positive".to_string());
        }
        if !self.executor_url.starts_with("http://") && !self.executor_url.starts_with("https://") {
            return Err("EXECUTOR_URL must be an http(s) URL".to_string());
        }
        Ok(())
    }
}

/// All tunables, one TOML table per component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub identity: IdentityTuning,
    pub proxy: ProxyTuning,
    pub delay: DelayTuning,
    pub admission: AdmissionTuning,
    pub jobs: OrchestratorTuning,
}

impl TuningConfig {
    /// Parse and validate a tuning file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatehouseError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let tuning = Self::from_toml(&content)?;
        Ok(tuning)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let tuning: TuningConfig = toml::from_str(content)?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn validate(&self) -> Result<()> {
        self.identity.validate()?;
        self.proxy.validate()?;
        self.delay.validate()?;
        self.admission.validate()?;
        self.jobs.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::SelectionStrategy;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["gatehouse"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_args_validate() {
        let args = args(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.worker_count, 4);
        assert_eq!(args.jobs_dir(), PathBuf::from("./data/jobs"));
        assert_eq!(args.identities_dir(), PathBuf::from("./data/identities"));
        assert!(!args.json_logs());
    }

    #[test]
    fn test_invalid_args_rejected() {
        assert!(args(&["--worker-count", "0"]).validate().is_err());
        assert!(args(&["--log-format", "yaml"]).validate().is_err());
        assert!(args(&["--executor-url", "ftp://x"]).validate().is_err());
    }

    #[test]
    fn test_partial_tuning_file() {
        let tuning = TuningConfig::from_toml(
            r#"
            [proxy]
            strategy = "round_robin"
            ema_alpha = 0.5

            [admission]
            risk_ceiling = 0.7

            [jobs]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(tuning.proxy.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(tuning.proxy.ema_alpha, 0.5);
        assert_eq!(tuning.admission.risk_ceiling, 0.7);
        assert_eq!(tuning.jobs.max_attempts, 5);
        // untouched sections keep their defaults
        assert_eq!(tuning.delay.medium_floor_ms, 4_000);
        assert_eq!(tuning.identity.cooldown_failure_threshold, 3);
    }

    #[test]
    fn test_inconsistent_tuning_rejected() {
        let err = TuningConfig::from_toml(
            r#"
            [proxy]
            degraded_failure_threshold = 8
            unhealthy_failure_threshold = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, GatehouseError::Config(_)));

        assert!(TuningConfig::from_toml("[delay]\nfast_floor_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.toml");
        std::fs::write(&path, "[identity]\ndefault_daily_limit = 20\n").unwrap();

        let tuning = TuningConfig::load(&path).unwrap();
        assert_eq!(tuning.identity.default_daily_limit, 20);
        assert!(TuningConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
