use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use stowage::depot::Depot;
use stowage::notify::{JsonlNotifier, LogNotifier, Notifier};
use stowage::scheduler::{self, ExpiryScheduler, SchedulerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("STOWAGE_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    stowage::observability::init(metrics_port);

    let data_dir = std::env::var("STOWAGE_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let outbox = std::env::var("STOWAGE_OUTBOX").ok();
    let lookahead_days: u32 = std::env::var("STOWAGE_LOOKAHEAD_DAYS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7);
    let batch_size: usize = std::env::var("STOWAGE_BATCH_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);
    let max_retries: u32 = std::env::var("STOWAGE_MAX_RETRIES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);
    let dispatch_interval_secs: u64 = std::env::var("STOWAGE_DISPATCH_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(86_400);
    let retry_interval_secs: u64 = std::env::var("STOWAGE_RETRY_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3_600);
    let compact_threshold: u64 = std::env::var("STOWAGE_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let depot = Arc::new(Depot::open(PathBuf::from(&data_dir).join("stowage.wal"))?);

    let notifier: Arc<dyn Notifier> = match &outbox {
        Some(path) => Arc::new(JsonlNotifier::open(Path::new(path))?),
        None => Arc::new(LogNotifier),
    };

    info!("stowage started");
    info!("  data_dir: {data_dir}");
    info!(
        "  restored: {} tenants, {} units, {} bookings",
        depot.tenant_count(),
        depot.unit_count(),
        depot.booking_count()
    );
    info!("  lookahead_days: {lookahead_days}");
    info!("  batch_size: {batch_size}");
    info!(
        "  outbox: {}",
        outbox.as_deref().unwrap_or("disabled (log transport)")
    );
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    let config = SchedulerConfig {
        lookahead_days,
        batch_size,
        max_retries,
        dispatch_interval: Duration::from_secs(dispatch_interval_secs),
        retry_interval: Duration::from_secs(retry_interval_secs),
    };
    let expiry = Arc::new(ExpiryScheduler::new(depot.clone(), notifier, config));

    let shutdown_token = CancellationToken::new();
    let mut tasks = expiry.clone().spawn_triggers(shutdown_token.clone());
    tasks.push(tokio::spawn(scheduler::run_compactor(
        depot.clone(),
        compact_threshold,
        shutdown_token.clone(),
    )));

    // Graceful shutdown: cancel the trigger loops on SIGTERM/ctrl-c and let
    // in-flight runs finish
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, stopping triggers");
    shutdown_token.cancel();

    // Wait for in-flight runs to finish (up to 30s)
    info!("draining pipeline runs...");
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain)
        .await
        .is_err()
    {
        tracing::warn!("drain timeout, runs still in flight");
    }

    info!("stowage stopped");
    Ok(())
}
