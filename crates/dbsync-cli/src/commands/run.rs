//! `dbsync run` command.

use std::sync::Arc;

use anyhow::Result;
use dbsync_maintenance::{MaintenanceDaemon, SyncTrigger};
use tokio::sync::broadcast;

use crate::opts::GlobalOpts;

use super::create_engine;

pub async fn cmd_run(opts: &GlobalOpts) -> Result<()> {
    let config = opts.resolve_config()?;
    let engine = Arc::new(create_engine(&config).await?);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl-C and SIGTERM for graceful shutdown
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                match term.as_mut() {
                    Some(t) => { t.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_signal.send(());
    });

    let daemon = MaintenanceDaemon::new(
        engine,
        SyncTrigger::new(),
        config.heartbeat_interval,
        shutdown_rx,
    );
    let status = daemon.status();
    daemon.run().await;

    let status = status.borrow().clone();
    tracing::info!(
        cycles = status.cycles,
        failed_cycles = status.failed_cycles,
        plan_version = status.plan_version,
        "daemon exited"
    );
    drop(shutdown_tx);
    Ok(())
}
