//! Facade exposed to the UI layer.
//!
//! [`OfflineSync`] wires the store, queue, worker, auto-retry engine and coordinator
//! of one client instance. Local writes and their queue items always commit in the
//! same store transaction.

use std::sync::Arc;

use chrono::Utc;
use fieldops_core::{DomainError, EntityId, InstanceId, MediaKey, QueueItemId};
use fieldops_events::MessageBus;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auto_retry::AutoRetryEngine;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityProbe;
use crate::coordinator::{CrossInstanceCoordinator, SyncSignal};
use crate::entities::{Client, Job, PhotoRecord, Record, SealReceipt, Technician};
use crate::error::{SyncError, SyncResult};
use crate::queue::MutationQueue;
use crate::remote::RemoteApi;
use crate::status::{StatusPoller, StatusSurface};
use crate::store::{LocalStore, StoreError, Table};
use crate::types::{
    AutoRetryProgress, DrainReport, EntityType, FailedItems, MediaReference, NewQueueItem,
    Operation, QueueStatus, RetryAllOutcome,
};
use crate::worker::SyncWorker;

/// Background tasks started by [`OfflineSync::start`].
#[derive(Debug)]
pub struct RunningSync {
    pub worker: JoinHandle<()>,
    pub auto_retry: JoinHandle<()>,
    pub status: StatusPoller,
}

impl RunningSync {
    /// Wait for every task to stop after shutdown was signalled.
    pub async fn join(self) {
        for (name, handle) in [("worker", self.worker), ("auto-retry", self.auto_retry)] {
            if let Err(err) = handle.await {
                tracing::warn!(task = name, "background task failed: {err}");
            }
        }
        self.status.join().await;
    }
}

pub struct OfflineSync {
    store: LocalStore,
    queue: MutationQueue,
    remote: Arc<dyn RemoteApi>,
    probe: Arc<dyn ConnectivityProbe>,
    worker: Arc<SyncWorker>,
    engine: Arc<AutoRetryEngine>,
    status: StatusSurface,
    config: SyncConfig,
}

impl std::fmt::Debug for OfflineSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSync")
            .field("instance", &self.instance())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineSync {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn ConnectivityProbe>,
        bus: Arc<dyn MessageBus<SyncSignal>>,
        instance: InstanceId,
        config: SyncConfig,
    ) -> Self {
        let queue = MutationQueue::new(store.clone(), config.worker_retry);
        let coordinator = Arc::new(CrossInstanceCoordinator::new(
            instance,
            store.clone(),
            bus,
            config.lease_ttl,
        ));
        let worker = Arc::new(SyncWorker::new(queue.clone(), remote.clone(), probe.clone()));
        let engine = Arc::new(AutoRetryEngine::new(
            queue.clone(),
            remote.clone(),
            probe.clone(),
            coordinator,
            config.auto_retry,
        ));
        let status = StatusSurface::new(
            queue.clone(),
            engine.clone(),
            probe.clone(),
            config.failed_display_limit,
        );

        Self {
            store,
            queue,
            remote,
            probe,
            worker,
            engine,
            status,
            config,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.engine.coordinator().instance()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn status(&self) -> &StatusSurface {
        &self.status
    }

    /// Recover abandoned in-flight items and start the worker, auto-retry and status
    /// loops. They stop when `shutdown` flips to `true`.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> SyncResult<RunningSync> {
        self.queue
            .requeue_stale_in_flight(self.config.stale_in_flight_after)
            .await?;

        let worker = self
            .worker
            .clone()
            .spawn(self.config.drain_interval, shutdown.clone());
        let auto_retry = self.engine.clone().spawn(shutdown.clone());
        let status = StatusPoller::spawn(
            self.status.clone(),
            self.config.status_poll_interval,
            shutdown,
        );

        tracing::info!(instance = %self.instance(), "offline sync started");
        Ok(RunningSync {
            worker,
            auto_retry,
            status,
        })
    }

    /// Connectivity came back: drain pending items and retry failed ones now.
    pub fn notify_online(&self) {
        self.worker.trigger();
        self.engine.trigger();
    }

    /// Queue a raw mutation. The entity id is taken from the payload's `id` field.
    pub async fn enqueue_mutation(
        &self,
        entity_type: EntityType,
        operation: Operation,
        payload: Value,
    ) -> SyncResult<QueueItemId> {
        let entity_id: EntityId = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::validation("mutation payload has no string 'id' field"))?
            .parse()?;

        let id = self
            .queue
            .enqueue(NewQueueItem::mutation(entity_type, entity_id, operation, payload))
            .await?;
        Ok(id)
    }

    /// Write `record` locally and queue its create or update in one transaction.
    pub async fn save<R: Record>(&self, record: &R) -> SyncResult<QueueItemId> {
        record.validate()?;
        let key = record.id().to_string();
        let payload = serde_json::to_value(record).map_err(StoreError::from)?;

        let mut tx = self.store.begin(&[R::TABLE, Table::QueueItems]).await?;
        let existing: Option<Value> = tx.get(R::TABLE, &key).await?;
        let operation = if existing.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };

        tx.put(R::TABLE, &key, record).await?;
        let id = self
            .queue
            .enqueue_in(
                &mut tx,
                NewQueueItem::mutation(R::ENTITY_TYPE, record.id(), operation, payload),
            )
            .await?;
        tx.commit().await?;

        Ok(id)
    }

    pub async fn save_job(&self, job: &Job) -> SyncResult<QueueItemId> {
        self.save(job).await
    }

    pub async fn save_client(&self, client: &Client) -> SyncResult<QueueItemId> {
        self.save(client).await
    }

    pub async fn save_technician(
        &self,
        technician: &Technician,
    ) -> SyncResult<QueueItemId> {
        self.save(technician).await
    }

    /// Remove a record locally and queue its deletion in one transaction.
    pub async fn delete<R: Record>(&self, id: EntityId) -> SyncResult<QueueItemId> {
        let key = id.to_string();
        let mut tx = self.store.begin(&[R::TABLE, Table::QueueItems]).await?;

        if !tx.delete(R::TABLE, &key).await? {
            return Err(DomainError::not_found(format!("{} {key}", R::ENTITY_TYPE.as_str())).into());
        }
        let item = self
            .queue
            .enqueue_in(
                &mut tx,
                NewQueueItem::mutation(
                    R::ENTITY_TYPE,
                    id,
                    Operation::Delete,
                    serde_json::json!({ "id": id }),
                ),
            )
            .await?;
        tx.commit().await?;

        Ok(item)
    }

    pub async fn job(&self, id: EntityId) -> SyncResult<Option<Job>> {
        Ok(self.store.get(Table::Jobs, &id.to_string()).await?)
    }

    pub async fn save_draft(&self, key: &str, draft: &Value) -> SyncResult<()> {
        Ok(self.store.put(Table::Drafts, key, draft).await?)
    }

    pub async fn draft(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.store.get(Table::Drafts, key).await?)
    }

    /// Store a captured photo and queue its upload.
    ///
    /// The blob, the job's photo record, the draft cleanup and the queue item commit
    /// together; on any failure (including a full quota) none of them exist.
    pub async fn attach_photo(
        &self,
        job_id: EntityId,
        bytes: &[u8],
        content_type: &str,
        draft_key: Option<&str>,
    ) -> SyncResult<MediaKey> {
        let job_key = job_id.to_string();
        let media_key = MediaKey::new();

        let mut tx = self
            .store
            .begin(&[Table::MediaBlobs, Table::Jobs, Table::Drafts, Table::QueueItems])
            .await?;

        tx.put_blob(&media_key, bytes, content_type).await?;

        let Some(mut job) = tx.get::<Job>(Table::Jobs, &job_key).await? else {
            return Err(DomainError::not_found(format!("job {job_key}")).into());
        };
        job.photos.push(PhotoRecord {
            media_key: media_key.clone(),
            content_type: content_type.to_string(),
            captured_at: Utc::now(),
            is_local_ref: true,
            remote_url: None,
        });
        job.updated_at = Utc::now();
        tx.put(Table::Jobs, &job_key, &job).await?;

        if let Some(draft) = draft_key {
            tx.delete(Table::Drafts, draft).await?;
        }

        self.queue
            .enqueue_in(
                &mut tx,
                NewQueueItem::upload(MediaReference::new(media_key.clone(), job_id, content_type)),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            job_id = %job_id,
            media_key = %media_key,
            bytes = bytes.len(),
            "photo stored and upload queued"
        );
        Ok(media_key)
    }

    /// Queue sealing of a job's evidence.
    pub async fn queue_seal(&self, job_id: EntityId) -> SyncResult<QueueItemId> {
        if self.job(job_id).await?.is_none() {
            return Err(DomainError::not_found(format!("job {job_id}")).into());
        }
        Ok(self.queue.enqueue_seal(job_id).await?)
    }

    /// Ask the backend whether the job's sealed evidence is intact.
    pub async fn verify_seal(&self, job_id: EntityId) -> SyncResult<SealReceipt> {
        if !self.probe.ping().await {
            return Err(SyncError::Offline);
        }
        Ok(self.remote.verify(&job_id.to_string()).await?)
    }

    pub async fn queue_status(&self) -> SyncResult<QueueStatus> {
        Ok(self.status.queue_status().await?)
    }

    pub async fn failed_items(&self) -> SyncResult<FailedItems> {
        Ok(self
            .status
            .failed_items(self.config.failed_display_limit)
            .await?)
    }

    pub fn auto_retry_progress(&self) -> AutoRetryProgress {
        self.status.auto_retry_progress()
    }

    pub async fn retry_item(&self, id: QueueItemId) -> SyncResult<bool> {
        Ok(self.engine.retry_item(id).await?)
    }

    pub async fn retry_all(&self) -> RetryAllOutcome {
        self.engine.retry_all().await
    }

    /// Drop a failed or pending item the user no longer wants synced.
    pub async fn discard(&self, id: QueueItemId) -> SyncResult<bool> {
        Ok(self.queue.discard(id).await?)
    }

    pub async fn drain_now(&self) -> DrainReport {
        self.worker.drain().await
    }
}
