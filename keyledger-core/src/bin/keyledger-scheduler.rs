//! Keyledger Rotation Scheduler
//!
//! Loads the key management configuration, opens the store and rotates keys
//! whose rotation period has elapsed on a fixed interval.
//!
//! The store directory (`KEYLEDGER_STORE__PATH`) is owned by one process at
//! a time. Run this binary only against a store no other keyledger process
//! has open; embed [`keyledger_core::RotationScheduler`] in the serving
//! process instead when the store is shared. Startup fails while another
//! process holds the directory.

use anyhow::Result;
use keyledger_config::KmsConfig;
use keyledger_core::{KmsService, RotationScheduler};
use keyledger_logging::{init_logging, LogFormat};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = KmsConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    init_logging(
        "keyledger-scheduler",
        config.log_level(),
        LogFormat::from_json_flag(config.log_json),
    );

    info!(
        envelope_backend = ?config.envelope.backend,
        verify_mode = ?config.audit.verify_mode,
        interval_secs = config.scheduler.interval_secs,
        "Configuration loaded"
    );

    let service = KmsService::from_config(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize key management service: {}", e))?;
    let service = Arc::new(service);

    if !config.scheduler.enabled {
        warn!("Rotation scheduler disabled by configuration, exiting");
        return Ok(());
    }

    let scheduler = RotationScheduler::new(service, config.scheduler.interval());
    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    info!("Rotation scheduler running. Press Ctrl+C to stop.");
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
        }
    }

    scheduler_handle.abort();
    info!("Rotation scheduler stopped");

    Ok(())
}
