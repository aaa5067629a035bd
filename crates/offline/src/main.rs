//! `fieldops-sync`: headless sync daemon for one client instance.

use std::sync::Arc;

use anyhow::Context;
use fieldops_core::InstanceId;
use fieldops_events::{InMemoryMessageBus, MessageBus};
use fieldops_offline::{
    HttpProbe, HttpRemoteApi, LocalStore, OfflineSync, SyncConfig, SyncSignal, default_db_path,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fieldops_observability::init();

    let config = SyncConfig::from_env().context("invalid sync configuration")?;
    let db_path = match &config.db_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };

    tracing::info!(api_url = %config.api_url, db_path = %db_path.display(), "starting fieldops-sync");

    let store = LocalStore::open(&db_path, config.media_quota_bytes).await?;
    let remote = HttpRemoteApi::new(
        config.api_url.clone(),
        config.api_token.clone(),
        config.request_timeout,
    )
    .context("failed to build HTTP client")?;
    let probe = HttpProbe::new(&config.api_url, config.probe_timeout);
    let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());

    let sync = OfflineSync::new(
        store,
        Arc::new(remote),
        Arc::new(probe),
        bus,
        InstanceId::new(),
        config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = sync.start(shutdown_rx).await?;

    let mut status = running.status.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C, shutting down");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    tracing::info!(
                        pending = snapshot.queue.pending,
                        failed = snapshot.queue.failed,
                        auto_retry_running = snapshot.auto_retry.is_running,
                        connectivity = ?snapshot.connectivity,
                        "sync status"
                    );
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    running.join().await;
    tracing::info!("fieldops-sync stopped");
    Ok(())
}
