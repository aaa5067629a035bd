//! Read-only status surface polled by the UI.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auto_retry::AutoRetryEngine;
use crate::connectivity::{ConnectivityProbe, ConnectivityState};
use crate::queue::MutationQueue;
use crate::store::StoreError;
use crate::types::{AutoRetryProgress, FailedItems, QueueStatus};

/// Everything the sync indicator shows, taken at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub queue: QueueStatus,
    pub failed: FailedItems,
    pub auto_retry: AutoRetryProgress,
    pub connectivity: ConnectivityState,
    pub taken_at: DateTime<Utc>,
}

/// Queries over queue state. Never mutates it.
#[derive(Clone)]
pub struct StatusSurface {
    queue: MutationQueue,
    engine: Arc<AutoRetryEngine>,
    probe: Arc<dyn ConnectivityProbe>,
    failed_display_limit: usize,
}

impl StatusSurface {
    pub fn new(
        queue: MutationQueue,
        engine: Arc<AutoRetryEngine>,
        probe: Arc<dyn ConnectivityProbe>,
        failed_display_limit: usize,
    ) -> Self {
        Self {
            queue,
            engine,
            probe,
            failed_display_limit,
        }
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, StoreError> {
        self.queue.status_counts().await
    }

    /// Oldest failed items up to `limit`, plus how many more there are.
    pub async fn failed_items(&self, limit: usize) -> Result<FailedItems, StoreError> {
        let items = self.queue.list_failed(limit).await?;
        let total = self.queue.status_counts().await?.failed;
        Ok(FailedItems {
            overflow: total.saturating_sub(items.len()),
            items,
        })
    }

    /// Progress of this instance's run, or of a run observed on another instance.
    pub fn auto_retry_progress(&self) -> AutoRetryProgress {
        let local = self.engine.state().progress();
        if local.is_running {
            return local;
        }
        self.engine
            .coordinator()
            .observed_progress()
            .unwrap_or(local)
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot, StoreError> {
        Ok(StatusSnapshot {
            queue: self.queue_status().await?,
            failed: self.failed_items(self.failed_display_limit).await?,
            auto_retry: self.auto_retry_progress(),
            connectivity: self.probe.state(),
            taken_at: Utc::now(),
        })
    }
}

/// Publishes a [`StatusSnapshot`] on a fixed interval.
#[derive(Debug)]
pub struct StatusPoller {
    receiver: watch::Receiver<Option<StatusSnapshot>>,
    handle: JoinHandle<()>,
}

impl StatusPoller {
    pub fn spawn(
        surface: StatusSurface,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (sender, receiver) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                match surface.snapshot().await {
                    Ok(snapshot) => {
                        tracing::debug!(
                            pending = snapshot.queue.pending,
                            failed = snapshot.queue.failed,
                            "status snapshot"
                        );
                        if sender.send(Some(snapshot)).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!("failed to read sync status: {err}"),
                }
            }
        });

        Self { receiver, handle }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StatusSnapshot>> {
        self.receiver.clone()
    }

    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.receiver.borrow().clone()
    }

    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            tracing::warn!("status poller task failed: {err}");
        }
    }
}
