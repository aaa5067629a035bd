//! Background drain of pending queue items.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityProbe;
use crate::queue::{Checkout, Completion, MutationQueue};
use crate::remote::{RemoteApi, RemoteError};
use crate::store::LocalStore;
use crate::types::{DrainReport, FailureClass, Operation, QueueItem, QueueItemStatus};

/// Result of one remote attempt for a queue item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Attempt {
    Applied(Completion),
    Failed {
        class: FailureClass,
        message: String,
        /// The backend could not be reached; later items would fail the same way.
        unreachable: bool,
    },
}

impl Attempt {
    fn permanent(message: impl Into<String>) -> Self {
        Attempt::Failed {
            class: FailureClass::Permanent,
            message: message.into(),
            unreachable: false,
        }
    }
}

impl From<RemoteError> for Attempt {
    fn from(err: RemoteError) -> Self {
        Attempt::Failed {
            class: err.class(),
            message: err.to_string(),
            unreachable: err.is_unreachable(),
        }
    }
}

/// Send one checked-out item to the backend. Never fails: every problem is folded
/// into [`Attempt::Failed`].
pub(crate) async fn attempt_item(
    remote: &dyn RemoteApi,
    store: &LocalStore,
    item: &QueueItem,
) -> Attempt {
    let result = match item.operation {
        Operation::Create => remote
            .create_entity(item.entity_type, &item.entity_id, &item.payload)
            .await
            .map(|_| Completion::Applied),
        Operation::Update => remote
            .update_entity(item.entity_type, &item.entity_id, &item.payload)
            .await
            .map(|_| Completion::Applied),
        Operation::Delete => remote
            .delete_entity(item.entity_type, &item.entity_id)
            .await
            .map(|_| Completion::Applied),
        Operation::Seal => remote
            .seal(&item.entity_id)
            .await
            .map(|receipt| Completion::Sealed { receipt }),
        Operation::Upload => {
            let (Some(reference), Some(key)) = (item.media_reference(), item.media_key.as_ref())
            else {
                return Attempt::permanent("upload item without a media reference");
            };

            let blob = match store.get_blob(key).await {
                Ok(Some(blob)) => blob,
                Ok(None) => {
                    return Attempt::permanent(format!("media blob {key} is missing locally"));
                }
                Err(err) => {
                    tracing::error!(item_id = %item.id, "failed to read media blob: {err}");
                    return Attempt::Failed {
                        class: FailureClass::Retryable,
                        message: format!("local store error: {err}"),
                        unreachable: false,
                    };
                }
            };

            remote
                .upload_media(&reference, &blob)
                .await
                .map(|remote_url| Completion::Uploaded { remote_url })
        }
    };

    match result {
        Ok(completion) => Attempt::Applied(completion),
        Err(err) => err.into(),
    }
}

/// Drains pending items one at a time while the backend is reachable.
///
/// The worker does not take the cross-instance lease: pending items are checked out
/// individually, so several instances may drain side by side.
pub struct SyncWorker {
    queue: MutationQueue,
    remote: Arc<dyn RemoteApi>,
    probe: Arc<dyn ConnectivityProbe>,
    drain_lock: Mutex<()>,
    trigger: Notify,
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker").finish_non_exhaustive()
    }
}

impl SyncWorker {
    pub fn new(
        queue: MutationQueue,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            queue,
            remote,
            probe,
            drain_lock: Mutex::new(()),
            trigger: Notify::new(),
        }
    }

    /// Ask the background loop to drain now (e.g. connectivity came back).
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run one drain pass. Item failures are recorded on the items, never returned.
    pub async fn drain(&self) -> DrainReport {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("drain already running in this instance");
            return DrainReport {
                already_running: true,
                ..Default::default()
            };
        };

        let mut report = DrainReport::default();

        if !self.probe.ping().await {
            tracing::debug!("skipping drain - backend unreachable");
            report.offline = true;
            return report;
        }

        loop {
            let item = match self.queue.dequeue_next().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!("failed to check out next queue item: {err}");
                    break;
                }
            };

            report.attempted += 1;
            tracing::debug!(
                item_id = %item.id,
                entity_type = item.entity_type.as_str(),
                operation = item.operation.as_str(),
                retry_count = item.retry_count,
                "sending queued mutation"
            );

            let checkout = Checkout::new(&self.queue, &item, QueueItemStatus::Pending);
            let unreachable =
                match attempt_item(self.remote.as_ref(), self.queue.store(), &item).await {
                    Attempt::Applied(completion) => {
                        match self.queue.complete(item.id, completion).await {
                            Ok(_) => report.succeeded += 1,
                            Err(err) => {
                                // The row stays in_flight and is recovered on the next start.
                                tracing::error!(
                                    item_id = %item.id,
                                    "backend applied the mutation but the local completion failed: {err}"
                                );
                            }
                        }
                        false
                    }
                    Attempt::Failed {
                        class,
                        message,
                        unreachable,
                    } => {
                        match self.queue.mark_failed(item.id, class, &message).await {
                            Ok(Some(QueueItemStatus::PermanentlyFailed)) => {
                                report.permanently_failed += 1
                            }
                            Ok(Some(_)) => report.requeued += 1,
                            Ok(None) => {}
                            Err(err) => {
                                tracing::error!(item_id = %item.id, "failed to record failure: {err}");
                            }
                        }
                        unreachable
                    }
                };
            checkout.settle();

            if unreachable {
                tracing::warn!("backend became unreachable, stopping this drain");
                report.interrupted = true;
                break;
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                requeued = report.requeued,
                permanently_failed = report.permanently_failed,
                "drain finished"
            );
        }

        report
    }

    /// Start the background loop: drain on every tick and on [`trigger`](Self::trigger),
    /// until `shutdown` flips to `true`.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("background sync worker started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("background sync worker received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {
                        tracing::debug!("drain triggered");
                    }
                }

                if *shutdown.borrow() {
                    break;
                }
                self.drain().await;
            }

            tracing::info!("background sync worker stopped");
        })
    }
}
