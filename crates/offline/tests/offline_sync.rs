use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fieldops_core::{EntityId, InstanceId};
use fieldops_events::{InMemoryMessageBus, MessageBus};
use fieldops_offline::{
    AutoRetryProgress, CrossInstanceCoordinator, EntityType, Job, LocalStore, ManualProbe,
    MediaBlob, MediaReference, OfflineSync, Operation, QueueItemStatus, RemoteApi, RemoteError,
    RetryAllOutcome, RetryPolicy, SealReceipt, SyncConfig, SyncSignal, Table,
};
use proptest::prelude::*;
use serde_json::{Value, json};
use tokio::task::JoinSet;

/// Backend double keeping the last applied payload per entity.
#[derive(Default)]
struct FakeBackend {
    records: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, RemoteError>>,
    uploads: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeBackend {
    fn fail(&self, entity_id: &str, err: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), err);
    }

    fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    fn record(&self, entity_id: &str) -> Option<Value> {
        self.records.lock().unwrap().get(entity_id).cloned()
    }

    fn slow_down(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    async fn respond(&self, entity_id: &str) -> Result<(), RemoteError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.failures.lock().unwrap().get(entity_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeBackend {
    async fn create_entity(
        &self,
        _entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        self.respond(entity_id).await?;
        self.records
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), payload.clone());
        Ok(())
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        self.create_entity(entity_type, entity_id, payload).await
    }

    async fn delete_entity(
        &self,
        _entity_type: EntityType,
        entity_id: &str,
    ) -> Result<(), RemoteError> {
        self.respond(entity_id).await?;
        self.records.lock().unwrap().remove(entity_id);
        Ok(())
    }

    async fn upload_media(
        &self,
        reference: &MediaReference,
        _blob: &MediaBlob,
    ) -> Result<String, RemoteError> {
        let key = reference.media_key.to_string();
        self.respond(&key).await?;
        self.uploads.lock().unwrap().push(key.clone());
        Ok(format!("https://cdn.fieldops.test/{key}"))
    }

    async fn seal(&self, job_id: &str) -> Result<SealReceipt, RemoteError> {
        self.respond(job_id).await?;
        Ok(SealReceipt {
            hash: format!("sha256:{job_id}"),
            signature: "sig".to_string(),
            sealed_at: Utc::now(),
        })
    }

    async fn verify(&self, job_id: &str) -> Result<SealReceipt, RemoteError> {
        self.seal(job_id).await
    }
}

struct Instance {
    sync: OfflineSync,
    backend: Arc<FakeBackend>,
    probe: Arc<ManualProbe>,
}

async fn instance_on(
    store: LocalStore,
    backend: Arc<FakeBackend>,
    bus: Arc<dyn MessageBus<SyncSignal>>,
    config: SyncConfig,
) -> Instance {
    let probe = Arc::new(ManualProbe::new(true));
    let sync = OfflineSync::new(
        store,
        backend.clone(),
        probe.clone(),
        bus,
        InstanceId::new(),
        config,
    );
    Instance {
        sync,
        backend,
        probe,
    }
}

async fn instance(config: SyncConfig) -> Instance {
    let store = LocalStore::open_in_memory(config.media_quota_bytes)
        .await
        .unwrap();
    let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());
    instance_on(store, Arc::new(FakeBackend::default()), bus, config).await
}

fn fast_config(max_retries: u32) -> SyncConfig {
    SyncConfig::default().with_worker_retry(RetryPolicy::immediate(max_retries))
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("fieldops-test-{}.db", EntityId::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

#[tokio::test]
async fn edits_made_offline_reach_the_backend_once_online() {
    let node = instance(fast_config(3)).await;
    node.probe.set_online(false);

    let mut jobs: Vec<Job> = (0..3).map(|i| Job::new(format!("job {i}"))).collect();
    for job in &jobs {
        node.sync.save_job(job).await.unwrap();
    }
    jobs[1].title = "job 1 (rescheduled)".to_string();
    node.sync.save_job(&jobs[1]).await.unwrap();

    assert!(node.sync.drain_now().await.offline);
    assert_eq!(node.sync.queue_status().await.unwrap().pending, 4);

    node.probe.set_online(true);
    let report = node.sync.drain_now().await;

    assert_eq!(report.succeeded, 4);
    for job in &jobs {
        let local = node.sync.job(job.id).await.unwrap().unwrap();
        assert_eq!(
            node.backend.record(&job.id.to_string()),
            Some(serde_json::to_value(&local).unwrap())
        );
    }
}

#[tokio::test]
async fn identical_updates_collapse_to_one_queue_item() {
    let node = instance(fast_config(3)).await;
    let job = EntityId::new();
    let payload = json!({ "id": job, "title": "Replace valve" });

    let first = node
        .sync
        .enqueue_mutation(EntityType::Job, Operation::Update, payload.clone())
        .await
        .unwrap();
    let second = node
        .sync
        .enqueue_mutation(EntityType::Job, Operation::Update, payload)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(node.sync.queue().list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn items_stop_after_the_retry_cap() {
    let node = instance(fast_config(3)).await;
    let job = Job::new("Unreachable site");
    let id = node.sync.save_job(&job).await.unwrap();
    node.backend.fail(
        &job.id.to_string(),
        RemoteError::Server {
            status: 502,
            message: "bad gateway".to_string(),
        },
    );

    node.sync.drain_now().await;

    let item = node.sync.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::PermanentlyFailed);
    assert_eq!(item.retry_count, 3);

    node.backend.heal();
    assert_eq!(node.sync.drain_now().await.attempted, 0);
}

#[tokio::test]
async fn photo_for_a_missing_job_leaves_no_blob_behind() {
    let node = instance(fast_config(3)).await;

    let err = node
        .sync
        .attach_photo(EntityId::new(), b"jpeg-bytes", "image/jpeg", None)
        .await
        .unwrap_err();

    assert!(!err.is_quota_exceeded());
    assert_eq!(node.sync.store().media_usage_bytes().await.unwrap(), 0);
    assert!(node.sync.queue().list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_photo_upload_keeps_its_blob_until_retried() {
    let node = instance(fast_config(1)).await;
    let job = Job::new("Fence repair");
    node.sync.save_job(&job).await.unwrap();
    let key = node
        .sync
        .attach_photo(job.id, b"jpeg-bytes", "image/jpeg", None)
        .await
        .unwrap();
    node.backend.fail(key.as_str(), RemoteError::Timeout);

    node.sync.drain_now().await;
    assert_eq!(node.sync.queue_status().await.unwrap().failed, 1);
    assert!(node.sync.store().get_blob(&key).await.unwrap().is_some());

    node.backend.heal();
    let outcome = node.sync.retry_all().await;
    assert_eq!(outcome.succeeded, 1);
    assert!(node.sync.store().get_blob(&key).await.unwrap().is_none());
    assert_eq!(node.backend.uploads.lock().unwrap().len(), 1);

    let stored: Job = node
        .sync
        .store()
        .get(Table::Jobs, &job.id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.photos[0].is_local_ref);
}

#[tokio::test]
async fn retry_all_recovers_both_failed_updates() {
    let node = instance(fast_config(1)).await;
    let a = Job::new("Pump A");
    let b = Job::new("Pump B");
    for (job, reason) in [(&a, "pump A rejected"), (&b, "pump B rejected")] {
        node.sync.save_job(job).await.unwrap();
        node.backend.fail(
            &job.id.to_string(),
            RemoteError::Server {
                status: 503,
                message: reason.to_string(),
            },
        );
    }

    node.sync.drain_now().await;

    let failed = node.sync.failed_items().await.unwrap();
    assert_eq!(failed.items.len(), 2);
    assert!(
        failed
            .items
            .iter()
            .all(|item| item.status == QueueItemStatus::PermanentlyFailed)
    );
    assert_ne!(failed.items[0].last_error, failed.items[1].last_error);

    node.backend.heal();
    let outcome = node.sync.retry_all().await;

    assert_eq!(
        outcome,
        RetryAllOutcome {
            succeeded: 2,
            failed: 0,
            already_syncing: false,
            message: None,
        }
    );
    assert!(node.sync.failed_items().await.unwrap().items.is_empty());
    assert!(node.backend.record(&a.id.to_string()).is_some());
    assert!(node.backend.record(&b.id.to_string()).is_some());
}

#[tokio::test]
async fn retry_all_is_refused_while_another_instance_drains() {
    let store = LocalStore::open_in_memory(1 << 20).await.unwrap();
    let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());
    let backend = Arc::new(FakeBackend::default());
    let tab_a = instance_on(store.clone(), backend.clone(), bus.clone(), fast_config(1)).await;
    let tab_b = instance_on(store.clone(), backend.clone(), bus.clone(), fast_config(1)).await;

    let job = Job::new("Shared job");
    tab_a.sync.save_job(&job).await.unwrap();
    backend.fail(&job.id.to_string(), RemoteError::Timeout);
    tab_a.sync.drain_now().await;
    backend.heal();

    let holder = CrossInstanceCoordinator::new(
        tab_b.sync.instance(),
        store.clone(),
        bus.clone(),
        Duration::from_secs(60),
    );
    let lease = holder.acquire().await.unwrap();
    holder.publish_progress(AutoRetryProgress {
        total: 1,
        recovered: 0,
        is_running: true,
    });

    let outcome = tab_a.sync.retry_all().await;
    assert!(outcome.already_syncing);
    assert_eq!(outcome.succeeded + outcome.failed, 0);
    assert!(tab_a.sync.auto_retry_progress().is_running);
    assert_eq!(tab_a.sync.queue_status().await.unwrap().failed, 1);

    lease.release().await;
    assert_eq!(tab_a.sync.retry_all().await.succeeded, 1);
}

#[tokio::test]
async fn cancelled_retry_all_gives_the_bucket_back() {
    let store = LocalStore::open_in_memory(1 << 20).await.unwrap();
    let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());
    let backend = Arc::new(FakeBackend::default());
    let tab_a = instance_on(store.clone(), backend.clone(), bus.clone(), fast_config(1)).await;
    let tab_b = instance_on(store.clone(), backend.clone(), bus.clone(), fast_config(1)).await;

    let job = Job::new("Slow backend");
    tab_a.sync.save_job(&job).await.unwrap();
    backend.fail(&job.id.to_string(), RemoteError::Timeout);
    tab_a.sync.drain_now().await;
    backend.heal();
    backend.slow_down(Duration::from_millis(300));

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), tab_a.sync.retry_all()).await;
    assert!(cancelled.is_err());

    let watcher = CrossInstanceCoordinator::new(
        InstanceId::new(),
        store.clone(),
        bus.clone(),
        Duration::from_secs(60),
    );
    let mut returned = false;
    for _ in 0..100 {
        let failed = tab_b.sync.queue_status().await.unwrap().failed;
        let observed = tab_b.sync.auto_retry_progress();
        if failed == 1 && !observed.is_running && !watcher.is_active().await {
            returned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(returned);
    assert!(!tab_a.sync.auto_retry_progress().is_running);
    assert!(!tab_b.sync.auto_retry_progress().is_running);

    let item = &tab_b.sync.failed_items().await.unwrap().items[0];
    assert_eq!(item.status, QueueItemStatus::PermanentlyFailed);
    assert_eq!(item.auto_retry_count, 0);

    backend.slow_down(Duration::ZERO);
    let outcome = tab_b.sync.retry_all().await;
    assert!(!outcome.already_syncing);
    assert_eq!(outcome.succeeded, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_saves_on_a_shared_database_all_commit() {
    let path = temp_db_path();
    let mut tabs = Vec::new();
    for _ in 0..4 {
        let store = LocalStore::open(&path, 1 << 20).await.unwrap();
        let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());
        let tab = instance_on(store, Arc::new(FakeBackend::default()), bus, fast_config(3)).await;
        tabs.push(Arc::new(tab));
    }

    let mut tasks = JoinSet::new();
    for worker in 0..8 {
        let tab = tabs[worker % tabs.len()].clone();
        tasks.spawn(async move {
            let mut errors = Vec::new();
            for i in 0..25 {
                let mut job = Job::new(format!("worker {worker} job {i}"));
                if let Err(err) = tab.sync.save_job(&job).await {
                    errors.push(err.to_string());
                }
                job.notes = "arrived on site".to_string();
                if let Err(err) = tab.sync.save_job(&job).await {
                    errors.push(err.to_string());
                }
            }
            errors
        });
    }

    let mut errors = Vec::new();
    while let Some(result) = tasks.join_next().await {
        errors.extend(result.unwrap());
    }
    let pending = tabs[0].sync.queue_status().await.unwrap().pending;

    drop(tabs);
    remove_db(&path);
    assert!(errors.is_empty(), "{} saves failed, first: {:?}", errors.len(), errors.first());
    assert_eq!(pending, 8 * 25 * 2);
}

#[tokio::test]
async fn one_lease_holder_across_processes_sharing_the_database() {
    let path = temp_db_path();
    let mut coordinators = Vec::new();
    for _ in 0..4 {
        let store = LocalStore::open(&path, 1 << 20).await.unwrap();
        let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());
        coordinators.push(CrossInstanceCoordinator::new(
            InstanceId::new(),
            store,
            bus,
            Duration::from_secs(60),
        ));
    }

    let mut tasks = JoinSet::new();
    for coordinator in coordinators {
        tasks.spawn(async move { coordinator.acquire().await });
    }
    let mut leases = Vec::new();
    while let Some(lease) = tasks.join_next().await {
        leases.extend(lease.unwrap());
    }

    assert_eq!(leases.len(), 1);
    for lease in leases {
        lease.release().await;
    }
    remove_db(&path);
}

#[tokio::test]
async fn abandoned_in_flight_items_are_recovered_on_start() {
    let path = temp_db_path();
    let job = Job::new("Crash recovery");
    {
        let store = LocalStore::open(&path, 1 << 20).await.unwrap();
        let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());
        let node = instance_on(store, Arc::new(FakeBackend::default()), bus, fast_config(3)).await;
        node.sync.save_job(&job).await.unwrap();
        node.sync.queue().dequeue_next().await.unwrap().unwrap();
    }

    let store = LocalStore::open(&path, 1 << 20).await.unwrap();
    let bus: Arc<dyn MessageBus<SyncSignal>> = Arc::new(InMemoryMessageBus::new());
    let config = SyncConfig {
        stale_in_flight_after: Duration::ZERO,
        drain_interval: Duration::from_secs(3600),
        ..fast_config(3)
    };
    let node = instance_on(store, Arc::new(FakeBackend::default()), bus, config).await;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let running = node.sync.start(shutdown_rx).await.unwrap();

    for _ in 0..200 {
        if node.backend.record(&job.id.to_string()).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    running.join().await;
    remove_db(&path);
    assert!(node.backend.record(&job.id.to_string()).is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn final_remote_state_matches_final_local_state(
        edits in prop::collection::vec((0usize..3, "[a-z]{1,8}", any::<bool>()), 1..20)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let node = instance(fast_config(3)).await;
            let mut jobs: Vec<Job> = (0..3).map(|i| Job::new(format!("job {i}"))).collect();

            for (index, title, drain) in edits {
                jobs[index].title = title;
                node.sync.save_job(&jobs[index]).await.unwrap();
                if drain {
                    node.sync.drain_now().await;
                }
            }
            node.sync.drain_now().await;

            assert!(node.sync.queue().list_all().await.unwrap().is_empty());
            for job in &jobs {
                let Some(local) = node.sync.job(job.id).await.unwrap() else {
                    continue;
                };
                assert_eq!(
                    node.backend.record(&job.id.to_string()),
                    Some(serde_json::to_value(&local).unwrap())
                );
            }
        });
    }
}
