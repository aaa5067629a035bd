//! Cross-instance coordination of the permanently failed bucket.
//!
//! Several client instances may share one local store. Draining the failed bucket
//! (auto-retry or "Retry All") must happen in at most one of them at a time. The
//! authority is a single lease row in the shared database, taken with one atomic
//! upsert; the lease expires after a TTL so a crashed holder cannot block the bucket
//! forever. Started/progress/finished notifications travel over the message bus so
//! other instances can show progress without doing the work twice.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fieldops_core::InstanceId;
use fieldops_events::{MessageBus, Subscription};
use serde::{Deserialize, Serialize};

use crate::store::{LocalStore, StoreError, map_sqlx_error};
use crate::types::AutoRetryProgress;

/// Bus topic carrying [`SyncSignal`]s.
pub const SYNC_TOPIC: &str = "sync";

const LEASE_NAME: &str = "failed-bucket";

/// Notification exchanged between instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncSignal {
    SyncStarted {
        instance: InstanceId,
    },
    Progress {
        instance: InstanceId,
        progress: AutoRetryProgress,
    },
    SyncFinished {
        instance: InstanceId,
    },
}

impl SyncSignal {
    pub fn instance(&self) -> InstanceId {
        match self {
            SyncSignal::SyncStarted { instance }
            | SyncSignal::Progress { instance, .. }
            | SyncSignal::SyncFinished { instance } => *instance,
        }
    }
}

/// The parts of a coordinator a lease needs to give itself back.
#[derive(Clone)]
struct LeaseHolder {
    instance: InstanceId,
    store: LocalStore,
    bus: Arc<dyn MessageBus<SyncSignal>>,
}

impl LeaseHolder {
    fn publish(&self, signal: SyncSignal) {
        if let Err(err) = self.bus.publish(SYNC_TOPIC, signal) {
            tracing::warn!("failed to broadcast sync signal: {err}");
        }
    }

    async fn release(&self) {
        let result = sqlx::query("DELETE FROM sync_lease WHERE name = ?1 AND holder = ?2")
            .bind(LEASE_NAME)
            .bind(self.instance.to_string())
            .execute(self.store.pool())
            .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => {
                tracing::info!(instance = %self.instance, "released failed-bucket lease");
            }
            Ok(_) => {
                tracing::debug!(instance = %self.instance, "release without holding the lease");
            }
            Err(err) => {
                tracing::error!(
                    instance = %self.instance,
                    "failed to release sync lease, it will expire: {err}"
                );
            }
        }

        self.publish(SyncSignal::SyncFinished {
            instance: self.instance,
        });
    }
}

/// Ownership of the failed bucket, returned by [`CrossInstanceCoordinator::acquire`].
///
/// Call [`release`](Self::release) when the run is over. A guard dropped without it
/// (cancelled run, panic) still releases the lease and broadcasts `SyncFinished` on a
/// spawned task.
#[must_use = "the lease is released as soon as the guard is dropped"]
pub struct LeaseGuard {
    holder: Option<LeaseHolder>,
}

impl LeaseGuard {
    pub async fn release(mut self) {
        if let Some(holder) = self.holder.take() {
            holder.release().await;
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("instance", &self.holder.as_ref().map(|h| h.instance))
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(holder) = self.holder.take() else {
            return;
        };

        tracing::warn!(instance = %holder.instance, "failed-bucket run ended without releasing its lease");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { holder.release().await });
            }
            Err(_) => {
                holder.publish(SyncSignal::SyncFinished {
                    instance: holder.instance,
                });
                tracing::error!("no runtime to release the sync lease, it will expire");
            }
        }
    }
}

pub struct CrossInstanceCoordinator {
    holder: LeaseHolder,
    subscription: Mutex<Subscription<SyncSignal>>,
    lease_ttl: Duration,
    observed: Mutex<Option<(InstanceId, AutoRetryProgress)>>,
}

impl std::fmt::Debug for CrossInstanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossInstanceCoordinator")
            .field("instance", &self.holder.instance)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl CrossInstanceCoordinator {
    pub fn new(
        instance: InstanceId,
        store: LocalStore,
        bus: Arc<dyn MessageBus<SyncSignal>>,
        lease_ttl: Duration,
    ) -> Self {
        let subscription = bus.subscribe(SYNC_TOPIC);
        Self {
            holder: LeaseHolder {
                instance,
                store,
                bus,
            },
            subscription: Mutex::new(subscription),
            lease_ttl,
            observed: Mutex::new(None),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.holder.instance
    }

    /// Whether any instance (this one included) holds an unexpired lease.
    ///
    /// A store error reports the bucket as busy.
    pub async fn is_active(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        let held: Result<i64, _> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_lease WHERE name = ?1 AND expires_at > ?2",
        )
        .bind(LEASE_NAME)
        .bind(now)
        .fetch_one(self.holder.store.pool())
        .await;

        match held {
            Ok(count) => count > 0,
            Err(err) => {
                tracing::error!("failed to read sync lease: {err}");
                true
            }
        }
    }

    /// Take the lease if nobody holds it. Not re-entrant: a second call from the
    /// holder returns `None` until the first guard is released.
    pub async fn acquire(&self) -> Option<LeaseGuard> {
        match self.try_acquire().await {
            Ok(true) => {
                tracing::info!(instance = %self.holder.instance, "acquired failed-bucket lease");
                self.publish(SyncSignal::SyncStarted {
                    instance: self.holder.instance,
                });
                Some(LeaseGuard {
                    holder: Some(self.holder.clone()),
                })
            }
            Ok(false) => {
                tracing::debug!(instance = %self.holder.instance, "failed-bucket lease held elsewhere");
                None
            }
            Err(err) => {
                tracing::error!(instance = %self.holder.instance, "failed to take sync lease: {err}");
                None
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.lease_ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO sync_lease (name, holder, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE sync_lease.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(LEASE_NAME)
        .bind(self.holder.instance.to_string())
        .bind(now)
        .bind(expires_at)
        .execute(self.holder.store.pool())
        .await
        .map_err(|e| map_sqlx_error("acquire_lease", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Push the lease expiry forward during a long run. Returns `false` if this
    /// instance no longer holds the lease.
    pub async fn renew(&self) -> bool {
        let expires_at = Utc::now().timestamp_millis() + self.lease_ttl.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE sync_lease SET expires_at = ?3 WHERE name = ?1 AND holder = ?2",
        )
        .bind(LEASE_NAME)
        .bind(self.holder.instance.to_string())
        .bind(expires_at)
        .execute(self.holder.store.pool())
        .await;

        match result {
            Ok(done) => done.rows_affected() == 1,
            Err(err) => {
                tracing::warn!("failed to renew sync lease: {err}");
                false
            }
        }
    }

    /// Give the lease back without a guard (e.g. after a restart with a lease row
    /// still naming this instance) and tell the other instances the run is over.
    pub async fn release(&self) {
        self.holder.release().await;
        self.absorb_signals();
    }

    pub fn publish_progress(&self, progress: AutoRetryProgress) {
        self.publish(SyncSignal::Progress {
            instance: self.holder.instance,
            progress,
        });
    }

    fn publish(&self, signal: SyncSignal) {
        self.holder.publish(signal);
        self.absorb_signals();
    }

    /// Latest progress of a run driven by another instance, if one is running.
    pub fn observed_progress(&self) -> Option<AutoRetryProgress> {
        self.absorb_signals();
        self.observed
            .lock()
            .ok()
            .and_then(|observed| observed.map(|(_, progress)| progress))
    }

    /// Fold buffered bus signals into the observed state, emptying the subscription.
    fn absorb_signals(&self) {
        let signals = match self.subscription.lock() {
            Ok(subscription) => subscription.drain(),
            Err(_) => Vec::new(),
        };

        let Ok(mut observed) = self.observed.lock() else {
            return;
        };

        for signal in signals {
            let from = signal.instance();
            if from == self.holder.instance {
                continue;
            }
            match signal {
                SyncSignal::SyncStarted { .. } => {
                    *observed = Some((
                        from,
                        AutoRetryProgress {
                            is_running: true,
                            ..Default::default()
                        },
                    ));
                }
                SyncSignal::Progress { progress, .. } => *observed = Some((from, progress)),
                SyncSignal::SyncFinished { .. } => {
                    if matches!(*observed, Some((holder, _)) if holder == from) {
                        *observed = None;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn buffered_signals(&self) -> usize {
        self.subscription
            .lock()
            .map(|subscription| subscription.drain().len())
            .unwrap_or_default()
    }
}
