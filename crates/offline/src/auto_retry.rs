//! Slow-tier re-attempts of permanently failed items.
//!
//! A run owns the failed bucket through the cross-instance lease for its whole
//! duration. Each eligible item is claimed, attempted once and either removed
//! (recovered) or put back with its auto-retry count bumped. User-driven "Retry All"
//! goes through the same path without the auto-retry cap.

use std::sync::{Arc, RwLock};

use fieldops_core::QueueItemId;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::AutoRetryConfig;
use crate::connectivity::ConnectivityProbe;
use crate::coordinator::CrossInstanceCoordinator;
use crate::queue::{Checkout, MutationQueue};
use crate::remote::RemoteApi;
use crate::store::StoreError;
use crate::types::{AutoRetryProgress, QueueItemStatus, RetryAllOutcome};
use crate::worker::{Attempt, attempt_item};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRetryRun {
    /// Another instance holds the failed bucket.
    Skipped,
    /// The backend is unreachable; nothing was attempted.
    Offline,
    Completed { total: usize, recovered: usize },
}

/// Outcome of re-attempting one failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemRetry {
    Recovered,
    Failed { unreachable: bool },
    /// Already claimed, recovered or discarded elsewhere.
    Unavailable,
}

/// Claim a permanently failed item, attempt it once and settle the outcome.
pub(crate) async fn retry_failed_item(
    queue: &MutationQueue,
    remote: &dyn RemoteApi,
    id: QueueItemId,
    auto_attempt: bool,
) -> Result<ItemRetry, StoreError> {
    let Some(item) = queue.claim_failed(id).await? else {
        return Ok(ItemRetry::Unavailable);
    };
    let checkout = Checkout::new(queue, &item, QueueItemStatus::PermanentlyFailed);

    match attempt_item(remote, queue.store(), &item).await {
        Attempt::Applied(completion) => {
            let completed = queue.complete(id, completion).await;
            checkout.settle();
            completed?;
            tracing::info!(
                item_id = %id,
                entity_type = item.entity_type.as_str(),
                auto_attempt,
                "failed item recovered"
            );
            Ok(ItemRetry::Recovered)
        }
        Attempt::Failed {
            class,
            message,
            unreachable,
        } => {
            let released = queue.release_failed(id, class, &message, auto_attempt).await;
            checkout.settle();
            released?;
            tracing::warn!(
                item_id = %id,
                entity_type = item.entity_type.as_str(),
                auto_retry_count = item.auto_retry_count + u32::from(auto_attempt),
                "retry of failed item failed: {message}"
            );
            Ok(ItemRetry::Failed { unreachable })
        }
    }
}

/// Progress of the run owned by this instance.
#[derive(Debug, Default)]
pub struct AutoRetryState {
    progress: RwLock<AutoRetryProgress>,
}

impl AutoRetryState {
    pub fn progress(&self) -> AutoRetryProgress {
        self.progress
            .read()
            .map(|p| *p)
            .unwrap_or_default()
    }

    fn set(&self, progress: AutoRetryProgress) {
        if let Ok(mut current) = self.progress.write() {
            *current = progress;
        }
    }
}

/// Clears the local "running" flag if a run is abandoned midway.
struct RunningFlag<'a>(&'a AutoRetryState);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        let progress = self.0.progress();
        if progress.is_running {
            self.0.set(AutoRetryProgress {
                is_running: false,
                ..progress
            });
        }
    }
}

pub struct AutoRetryEngine {
    queue: MutationQueue,
    remote: Arc<dyn RemoteApi>,
    probe: Arc<dyn ConnectivityProbe>,
    coordinator: Arc<CrossInstanceCoordinator>,
    config: AutoRetryConfig,
    state: AutoRetryState,
    trigger: Notify,
}

impl std::fmt::Debug for AutoRetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoRetryEngine")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AutoRetryEngine {
    pub fn new(
        queue: MutationQueue,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn ConnectivityProbe>,
        coordinator: Arc<CrossInstanceCoordinator>,
        config: AutoRetryConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            probe,
            coordinator,
            config,
            state: AutoRetryState::default(),
            trigger: Notify::new(),
        }
    }

    pub fn state(&self) -> &AutoRetryState {
        &self.state
    }

    pub fn coordinator(&self) -> &Arc<CrossInstanceCoordinator> {
        &self.coordinator
    }

    /// Ask the background loop to run now (e.g. connectivity came back).
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    fn publish(&self, progress: AutoRetryProgress) {
        self.state.set(progress);
        self.coordinator.publish_progress(progress);
    }

    /// One auto-retry pass over the failed bucket.
    pub async fn run_once(&self) -> AutoRetryRun {
        if !self.probe.ping().await {
            tracing::debug!("skipping auto-retry - backend unreachable");
            return AutoRetryRun::Offline;
        }
        let Some(lease) = self.coordinator.acquire().await else {
            tracing::info!("skipping auto-retry - another instance is draining failed items");
            return AutoRetryRun::Skipped;
        };

        let (total, recovered) = self.drain_failed(Some(self.config.max_attempts), true).await;
        lease.release().await;

        if total > 0 {
            tracing::info!(total, recovered, "auto-retry run finished");
        }
        AutoRetryRun::Completed { total, recovered }
    }

    /// User-triggered re-attempt of every failed item, ignoring the auto-retry cap.
    pub async fn retry_all(&self) -> RetryAllOutcome {
        let Some(lease) = self.coordinator.acquire().await else {
            tracing::info!("retry all requested while failed items are already syncing");
            return RetryAllOutcome::already_syncing();
        };

        let (total, succeeded) = self.drain_failed(None, false).await;
        lease.release().await;

        let failed = total - succeeded;
        tracing::info!(succeeded, failed, "retry all finished");
        RetryAllOutcome {
            succeeded,
            failed,
            already_syncing: false,
            message: None,
        }
    }

    /// User-triggered re-attempt of one failed item. Returns whether it was recovered.
    pub async fn retry_item(&self, id: QueueItemId) -> Result<bool, StoreError> {
        let outcome = retry_failed_item(&self.queue, self.remote.as_ref(), id, false).await?;
        Ok(outcome == ItemRetry::Recovered)
    }

    /// Attempt every failed item (below `cap`) once. The caller holds the lease.
    async fn drain_failed(&self, cap: Option<u32>, auto_attempt: bool) -> (usize, usize) {
        let ids = match self.queue.failed_ids(cap).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::error!("failed to list failed items: {err}");
                return (0, 0);
            }
        };

        let mut progress = AutoRetryProgress {
            total: ids.len(),
            recovered: 0,
            is_running: true,
        };
        let mut attempted = 0;
        let running = RunningFlag(&self.state);
        self.publish(progress);

        for id in ids {
            match retry_failed_item(&self.queue, self.remote.as_ref(), id, auto_attempt).await {
                Ok(ItemRetry::Recovered) => {
                    attempted += 1;
                    progress.recovered += 1;
                }
                Ok(ItemRetry::Failed { unreachable }) => {
                    attempted += 1;
                    if unreachable && auto_attempt {
                        tracing::warn!("backend became unreachable, stopping auto-retry run");
                        break;
                    }
                }
                Ok(ItemRetry::Unavailable) => {}
                Err(err) => {
                    attempted += 1;
                    tracing::error!(item_id = %id, "failed to settle retried item: {err}");
                }
            }

            self.coordinator.renew().await;
            self.publish(progress);
        }

        progress.total = attempted;
        progress.is_running = false;
        self.publish(progress);
        drop(running);
        (attempted, progress.recovered)
    }

    /// Start the background loop: a run per interval and per [`trigger`](Self::trigger),
    /// until `shutdown` flips to `true`.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval = ?self.config.interval,
                max_attempts = self.config.max_attempts,
                "auto-retry engine started"
            );

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {
                        tracing::debug!("auto-retry triggered");
                    }
                }

                if *shutdown.borrow() {
                    break;
                }
                self.run_once().await;
            }

            tracing::info!("auto-retry engine stopped");
        })
    }
}
