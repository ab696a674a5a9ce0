//! Gatehouse - admission control and bulk job orchestration

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::{
    clock::SystemClock,
    config::{Args, TuningConfig},
    engine::{spawn_snapshot_task, Engine},
    identity::FileIdentityStore,
    jobs::{FileJobStore, HttpExecutor},
    logging::AuditLogger,
    proxy::{import_proxies, spawn_health_probe_task, TcpConnectProber},
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // RUST_LOG overrides --log-level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gatehouse={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Gatehouse");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Data dir: {}", args.data_dir.display());
    info!("Workers: {}", args.worker_count);
    info!("Executor: {}", args.executor_url);
    info!("======================================");

    let tuning = match &args.tuning_file {
        Some(path) => {
            info!(path = %path.display(), "Loading tuning file");
            TuningConfig::load(path)?
        }
        None => TuningConfig::default(),
    };

    let audit = AuditLogger::new();
    if let Some(path) = &args.audit_log {
        audit.init_file(path.clone()).await?;
        info!(path = %path.display(), "Audit log enabled");
    }

    let store = Arc::new(FileJobStore::open(args.jobs_dir()).await?);
    let identity_store = Arc::new(FileIdentityStore::open(args.identities_dir()).await?);
    let executor = Arc::new(HttpExecutor::new(
        &args.executor_url,
        Duration::from_millis(args.execution_timeout_ms),
    )?);

    let engine = Arc::new(Engine::new(
        &tuning,
        store,
        identity_store,
        executor,
        Arc::new(SystemClock),
        audit,
    ));

    let (identities, proxies) = engine.load_snapshots(&args.data_dir).await?;
    info!(identities, proxies, "Restored snapshots");

    if let Some(path) = &args.identity_file {
        let registered = engine.seed_identities(path).await?;
        info!(registered, path = %path.display(), "Seeded identities");
    }

    if let Some(path) = &args.proxy_file {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let report = import_proxies(&engine.proxies, &content, None)?;
                info!(
                    registered = report.registered.len(),
                    path = %path.display(),
                    "Imported proxy file"
                );
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read proxy file"),
        }
    }

    if args.probe_interval_secs > 0 {
        spawn_health_probe_task(
            Arc::clone(&engine.proxies),
            Arc::new(TcpConnectProber::new(Duration::from_millis(args.probe_timeout_ms))),
            Duration::from_secs(args.probe_interval_secs),
        );
    } else {
        info!("Proxy probing disabled");
    }

    spawn_snapshot_task(
        Arc::clone(&engine),
        args.data_dir.clone(),
        Duration::from_secs(args.snapshot_interval_secs),
    );

    // Workers first so resumed jobs never fill the queue
    let _workers = engine.start_workers(args.worker_count)?;
    let resumed = engine.orchestrator.resume_incomplete().await?;
    if resumed > 0 {
        info!(resumed, "Resumed incomplete jobs");
    }

    let state = Arc::new(AppState::new(Arc::clone(&engine)));
    let result = server::run(state, args.listen).await;

    if let Err(e) = engine.save_snapshots(&args.data_dir).await {
        error!(error = %e, "Failed to write final snapshots");
    }
    result?;
    Ok(())
}
