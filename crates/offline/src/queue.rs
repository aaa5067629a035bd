//! Durable mutation queue persisted in the local store.
//!
//! One row per pending local mutation (`queue_items`). Rows are checked out with a
//! single conditional `UPDATE .. RETURNING`, so two consumers (tasks or instances
//! sharing the database file) never receive the same item.
//!
//! Ordering: items are handed out in insertion order (`seq`), and an item is only
//! eligible once every older item for the same entity has left the queue. That keeps
//! per-entity FIFO even when an older item is backing off or permanently failed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldops_core::{EntityId, MediaKey, QueueItemId};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};

use crate::entities::{Job, SealReceipt};
use crate::retry::RetryPolicy;
use crate::store::{LocalStore, StoreError, StoreTx, Table, map_sqlx_error};
use crate::types::{
    EntityType, FailureClass, NewQueueItem, Operation, QueueItem, QueueItemStatus, QueueStatus,
};

const ITEM_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, media_key, \
     enqueued_at, retry_count, max_retries, auto_retry_count, next_attempt_at, status, \
     last_error, failure_class";

/// What a successful remote call produced, applied locally when the item is removed.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Applied,
    /// The photo is on the backend; flag the job's photo record and drop the blob.
    Uploaded { remote_url: String },
    /// The job's evidence is sealed; keep the receipt on the local job.
    Sealed { receipt: SealReceipt },
}

/// A checked-out item whose outcome is not recorded yet.
///
/// Dropped before [`settle`](Self::settle) (the attempt was cancelled or panicked), it
/// puts the item back in the state it was checked out from on a spawned task, so it
/// does not sit `in_flight` until the next start.
#[must_use = "an unsettled checkout is returned to the queue when dropped"]
pub(crate) struct Checkout {
    unsettled: Option<Unsettled>,
}

struct Unsettled {
    queue: MutationQueue,
    id: QueueItemId,
    back_to: QueueItemStatus,
    last_error: Option<String>,
    failure_class: Option<FailureClass>,
}

impl Checkout {
    pub(crate) fn new(queue: &MutationQueue, item: &QueueItem, back_to: QueueItemStatus) -> Self {
        Self {
            unsettled: Some(Unsettled {
                queue: queue.clone(),
                id: item.id,
                back_to,
                last_error: item.last_error.clone(),
                failure_class: item.failure_class,
            }),
        }
    }

    /// The outcome has been recorded; keep the item where it is.
    pub(crate) fn settle(mut self) {
        self.unsettled = None;
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(item) = self.unsettled.take() else {
            return;
        };

        tracing::warn!(item_id = %item.id, "attempt abandoned before its outcome was recorded");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(item_id = %item.id, "no runtime to return the item, it stays in flight");
            return;
        };
        runtime.spawn(async move {
            let returned = item
                .queue
                .return_checkout(
                    item.id,
                    item.back_to,
                    item.last_error.as_deref(),
                    item.failure_class,
                )
                .await;
            if let Err(err) = returned {
                tracing::error!(item_id = %item.id, "failed to return abandoned item: {err}");
            }
        });
    }
}

/// SQLite-backed mutation queue.
///
/// This struct is cheap to clone and is safe to share across tasks.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    store: LocalStore,
    policy: RetryPolicy,
}

impl MutationQueue {
    pub fn new(store: LocalStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a mutation, collapsing it into a waiting item for the same entity and
    /// operation when there is one. Returns the effective item id.
    pub async fn enqueue(&self, item: NewQueueItem) -> Result<QueueItemId, StoreError> {
        let mut tx = self.store.begin(&[Table::QueueItems]).await?;
        let id = self.enqueue_in(&mut tx, item).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Same as [`enqueue`](Self::enqueue), inside a caller's transaction.
    ///
    /// Collapsing only targets the newest queued item of the entity; an older item
    /// followed by a different operation is left alone so per-entity order holds.
    pub async fn enqueue_in(
        &self,
        tx: &mut StoreTx,
        item: NewQueueItem,
    ) -> Result<QueueItemId, StoreError> {
        item.validate()?;
        let now = Utc::now();

        let tail = sqlx::query(
            r#"
            SELECT id, operation, payload, status
            FROM queue_items
            WHERE entity_type = ?1
              AND entity_id = ?2
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(item.entity_type.as_str())
        .bind(&item.entity_id)
        .fetch_optional(tx.reader())
        .await
        .map_err(|e| map_sqlx_error("enqueue_lookup", e))?;

        if let Some(row) = tail {
            let operation: String = row.try_get("operation").map_err(decode_err)?;
            let status: String = row.try_get("status").map_err(decode_err)?;
            let id: String = row.try_get("id").map_err(decode_err)?;

            if operation == item.operation.as_str() {
                let id: QueueItemId = id.parse()?;
                match status.parse::<QueueItemStatus>()? {
                    QueueItemStatus::Pending => {
                        let existing: String = row.try_get("payload").map_err(decode_err)?;
                        let existing: Value = serde_json::from_str(&existing)?;
                        if existing == item.payload {
                            tracing::debug!(item_id = %id, "identical mutation already pending");
                            return Ok(id);
                        }

                        sqlx::query(
                            "UPDATE queue_items SET payload = ?2, media_key = ?3 WHERE id = ?1",
                        )
                        .bind(id.to_string())
                        .bind(item.payload.to_string())
                        .bind(item.media_key.as_ref().map(MediaKey::to_string))
                        .execute(tx.writer(Table::QueueItems)?)
                        .await
                        .map_err(|e| map_sqlx_error("enqueue_collapse", e))?;

                        tracing::debug!(
                            item_id = %id,
                            entity_type = item.entity_type.as_str(),
                            operation = item.operation.as_str(),
                            "collapsed mutation into pending item"
                        );
                        return Ok(id);
                    }
                    QueueItemStatus::PermanentlyFailed => {
                        sqlx::query(
                            r#"
                            UPDATE queue_items
                            SET payload = ?2,
                                media_key = ?3,
                                status = 'pending',
                                retry_count = 0,
                                auto_retry_count = 0,
                                next_attempt_at = ?4,
                                last_error = NULL,
                                failure_class = NULL
                            WHERE id = ?1
                            "#,
                        )
                        .bind(id.to_string())
                        .bind(item.payload.to_string())
                        .bind(item.media_key.as_ref().map(MediaKey::to_string))
                        .bind(now.timestamp_millis())
                        .execute(tx.writer(Table::QueueItems)?)
                        .await
                        .map_err(|e| map_sqlx_error("enqueue_revive", e))?;

                        tracing::info!(
                            item_id = %id,
                            entity_type = item.entity_type.as_str(),
                            "new edit superseded a permanently failed item"
                        );
                        return Ok(id);
                    }
                    // The in-flight item is not touched; the edit becomes a follow-up.
                    QueueItemStatus::InFlight => {}
                }
            }
        }

        let id = QueueItemId::new();
        let max_retries = item.max_retries.unwrap_or(self.policy.max_retries);

        sqlx::query(
            r#"
            INSERT INTO queue_items (
                id,
                entity_type,
                entity_id,
                operation,
                payload,
                media_key,
                enqueued_at,
                retry_count,
                max_retries,
                auto_retry_count,
                next_attempt_at,
                status
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 0, ?9, 'pending')
            "#,
        )
        .bind(id.to_string())
        .bind(item.entity_type.as_str())
        .bind(&item.entity_id)
        .bind(item.operation.as_str())
        .bind(item.payload.to_string())
        .bind(item.media_key.as_ref().map(MediaKey::to_string))
        .bind(now.to_rfc3339())
        .bind(max_retries as i64)
        .bind(now.timestamp_millis())
        .execute(tx.writer(Table::QueueItems)?)
        .await
        .map_err(|e| map_sqlx_error("enqueue_insert", e))?;

        tracing::debug!(
            item_id = %id,
            entity_type = item.entity_type.as_str(),
            entity_id = %item.entity_id,
            operation = item.operation.as_str(),
            "queued mutation"
        );

        Ok(id)
    }

    /// Check out the oldest ready pending item, moving it to `in_flight`.
    pub async fn dequeue_next(&self) -> Result<Option<QueueItem>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();

        let row = sqlx::query(&format!(
            r#"
            UPDATE queue_items
            SET status = 'in_flight',
                claimed_at = ?1
            WHERE seq = (
                SELECT q.seq
                FROM queue_items q
                WHERE q.status = 'pending'
                  AND q.next_attempt_at <= ?1
                  AND NOT EXISTS (
                      SELECT 1
                      FROM queue_items older
                      WHERE older.entity_type = q.entity_type
                        AND older.entity_id = q.entity_id
                        AND older.seq < q.seq
                  )
                ORDER BY q.seq ASC
                LIMIT 1
            )
              AND status = 'pending'
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(now_ms)
        .fetch_optional(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("dequeue_next", e))?;

        row.map(row_to_item).transpose()
    }

    /// Remove a successfully applied item and reclaim its media blob.
    pub async fn mark_succeeded(&self, id: QueueItemId) -> Result<bool, StoreError> {
        self.complete(id, Completion::Applied).await
    }

    /// Remove a successfully uploaded photo item, flag the job's photo record as
    /// uploaded and reclaim the blob, all in one transaction.
    pub async fn mark_upload_succeeded(
        &self,
        id: QueueItemId,
        remote_url: String,
    ) -> Result<bool, StoreError> {
        self.complete(id, Completion::Uploaded { remote_url }).await
    }

    /// Remove an item whose remote call succeeded, applying `completion` locally.
    pub async fn complete(
        &self,
        id: QueueItemId,
        completion: Completion,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .store
            .begin(&[Table::QueueItems, Table::MediaBlobs, Table::Jobs])
            .await?;

        let Some(item) = fetch_item(tx.reader(), id).await? else {
            return Ok(false);
        };

        match completion {
            Completion::Applied => {}
            Completion::Uploaded { remote_url } => {
                if let Some(reference) = item.media_reference() {
                    let job_key = reference.job_id.to_string();
                    if let Some(mut job) = tx.get::<Job>(Table::Jobs, &job_key).await? {
                        if let Some(photo) = job.photo_mut(&reference.media_key) {
                            photo.is_local_ref = false;
                            photo.remote_url = Some(remote_url);
                        }
                        tx.put(Table::Jobs, &job_key, &job).await?;
                    }
                }
            }
            Completion::Sealed { receipt } => {
                if let Some(mut job) = tx.get::<Job>(Table::Jobs, &item.entity_id).await? {
                    job.seal = Some(receipt);
                    tx.put(Table::Jobs, &item.entity_id, &job).await?;
                }
            }
        }

        sqlx::query("DELETE FROM queue_items WHERE id = ?1")
            .bind(id.to_string())
            .execute(tx.writer(Table::QueueItems)?)
            .await
            .map_err(|e| map_sqlx_error("complete_item", e))?;

        if let Some(key) = &item.media_key {
            tx.delete_blob(key).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            item_id = %id,
            entity_type = item.entity_type.as_str(),
            "queue item applied and removed"
        );
        Ok(true)
    }

    /// Record a failed attempt of a checked-out item.
    ///
    /// Retryable failures go back to `pending` behind a backoff delay until the item's
    /// retry cap is reached; permanent failures (and exhausted items) move to
    /// `permanently_failed`. Returns the new status, or `None` if the item is gone.
    pub async fn mark_failed(
        &self,
        id: QueueItemId,
        class: FailureClass,
        error: &str,
    ) -> Result<Option<QueueItemStatus>, StoreError> {
        let mut tx = self.store.begin(&[Table::QueueItems]).await?;

        let Some(item) = fetch_item(tx.reader(), id).await? else {
            return Ok(None);
        };

        let failures = item.retry_count + 1;
        let now_ms = Utc::now().timestamp_millis();
        let (status, next_attempt_at) = match class {
            FailureClass::Retryable if self.policy.should_retry(failures, item.max_retries) => {
                let delay = self.policy.delay_for_attempt(failures);
                (QueueItemStatus::Pending, now_ms + delay.as_millis() as i64)
            }
            _ => (QueueItemStatus::PermanentlyFailed, now_ms),
        };

        sqlx::query(
            r#"
            UPDATE queue_items
            SET status = ?2,
                retry_count = ?3,
                next_attempt_at = ?4,
                last_error = ?5,
                failure_class = ?6,
                claimed_at = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(failures as i64)
        .bind(next_attempt_at)
        .bind(error)
        .bind(class.as_str())
        .execute(tx.writer(Table::QueueItems)?)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        tx.commit().await?;

        match status {
            QueueItemStatus::PermanentlyFailed => tracing::error!(
                item_id = %id,
                entity_type = item.entity_type.as_str(),
                retry_count = failures,
                failure_class = class.as_str(),
                "queue item permanently failed: {error}"
            ),
            _ => tracing::warn!(
                item_id = %id,
                entity_type = item.entity_type.as_str(),
                retry_count = failures,
                "queue item failed, will retry: {error}"
            ),
        }

        Ok(Some(status))
    }

    /// Check out a permanently failed item for a single re-attempt.
    pub async fn claim_failed(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE queue_items
            SET status = 'in_flight',
                claimed_at = ?2
            WHERE id = ?1
              AND status = 'permanently_failed'
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("claim_failed", e))?;

        row.map(row_to_item).transpose()
    }

    /// Return a re-attempted item to the failed bucket with its new error.
    ///
    /// `auto_attempt` counts the attempt against the auto-retry cap.
    pub async fn release_failed(
        &self,
        id: QueueItemId,
        class: FailureClass,
        error: &str,
        auto_attempt: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'permanently_failed',
                last_error = ?2,
                failure_class = ?3,
                auto_retry_count = auto_retry_count + ?4,
                claimed_at = NULL
            WHERE id = ?1
              AND status = 'in_flight'
            "#,
        )
        .bind(id.to_string())
        .bind(error)
        .bind(class.as_str())
        .bind(i64::from(auto_attempt))
        .execute(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("release_failed", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Put an in-flight item back to `status` with its previous error, ready right away.
    /// Counters are left alone: the interrupted attempt is not a failure.
    pub(crate) async fn return_checkout(
        &self,
        id: QueueItemId,
        status: QueueItemStatus,
        last_error: Option<&str>,
        failure_class: Option<FailureClass>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = ?2,
                last_error = ?3,
                failure_class = ?4,
                next_attempt_at = ?5,
                claimed_at = NULL
            WHERE id = ?1
              AND status = 'in_flight'
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(last_error)
        .bind(failure_class.map(|class| class.as_str()))
        .bind(Utc::now().timestamp_millis())
        .execute(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("return_checkout", e))?;

        if result.rows_affected() > 0 {
            tracing::info!(item_id = %id, status = status.as_str(), "returned abandoned item");
        }
        Ok(result.rows_affected() > 0)
    }

    /// Drop an item the user gave up on, with its media blob.
    ///
    /// In-flight items cannot be discarded.
    pub async fn discard(&self, id: QueueItemId) -> Result<bool, StoreError> {
        let mut tx = self
            .store
            .begin(&[Table::QueueItems, Table::MediaBlobs])
            .await?;

        let row = sqlx::query(
            r#"
            DELETE FROM queue_items
            WHERE id = ?1
              AND status != 'in_flight'
            RETURNING media_key
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(tx.writer(Table::QueueItems)?)
        .await
        .map_err(|e| map_sqlx_error("discard", e))?;

        let Some(row) = row else {
            return Ok(false);
        };

        let media_key: Option<String> = row.try_get("media_key").map_err(decode_err)?;
        if let Some(key) = media_key {
            tx.delete_blob(&key.parse()?).await?;
        }

        tx.commit().await?;
        tracing::info!(item_id = %id, "queue item discarded by user");
        Ok(true)
    }

    /// Return items left `in_flight` by a process that died mid-attempt to `pending`.
    ///
    /// Only items checked out longer than `older_than` ago are touched, so live
    /// instances sharing the database keep their checkouts.
    pub async fn requeue_stale_in_flight(&self, older_than: Duration) -> Result<u64, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let cutoff = now_ms - older_than.as_millis() as i64;

        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'pending',
                next_attempt_at = ?1,
                claimed_at = NULL
            WHERE status = 'in_flight'
              AND (claimed_at IS NULL OR claimed_at <= ?2)
            "#,
        )
        .bind(now_ms)
        .bind(cutoff)
        .execute(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        if result.rows_affected() > 0 {
            tracing::warn!(
                count = result.rows_affected(),
                "requeued in-flight items abandoned by a previous run"
            );
        }
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("get_item", e))?;
        fetch_item(&mut conn, id).await
    }

    /// Pending (including in-flight) and permanently failed counts.
    pub async fn status_counts(&self) -> Result<QueueStatus, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM queue_items GROUP BY status")
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| map_sqlx_error("status_counts", e))?;

        let mut status = QueueStatus::default();
        for row in rows {
            let label: String = row.try_get("status").map_err(decode_err)?;
            let n: i64 = row.try_get("n").map_err(decode_err)?;
            match label.parse::<QueueItemStatus>()? {
                QueueItemStatus::Pending | QueueItemStatus::InFlight => status.pending += n as usize,
                QueueItemStatus::PermanentlyFailed => status.failed += n as usize,
            }
        }
        Ok(status)
    }

    /// Permanently failed items, oldest first.
    pub async fn list_failed(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM queue_items
            WHERE status = 'permanently_failed'
            ORDER BY seq ASC
            LIMIT ?1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        rows.into_iter().map(row_to_item).collect()
    }

    /// Ids of permanently failed items, oldest first; `auto_retry_cap` skips items
    /// whose auto-retry budget is used up.
    pub async fn failed_ids(&self, auto_retry_cap: Option<u32>) -> Result<Vec<QueueItemId>, StoreError> {
        let cap = auto_retry_cap.map(i64::from).unwrap_or(i64::MAX);
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM queue_items
            WHERE status = 'permanently_failed'
              AND auto_retry_count < ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(cap)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("failed_ids", e))?;

        ids.iter()
            .map(|id| id.parse().map_err(StoreError::from))
            .collect()
    }

    /// Every queued item in queue order.
    pub async fn list_all(&self) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items ORDER BY seq ASC"
        ))
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| map_sqlx_error("list_all", e))?;

        rows.into_iter().map(row_to_item).collect()
    }

    /// Queue a seal of `job_id`'s evidence.
    pub async fn enqueue_seal(&self, job_id: EntityId) -> Result<QueueItemId, StoreError> {
        self.enqueue(NewQueueItem::mutation(
            EntityType::Job,
            job_id,
            Operation::Seal,
            serde_json::json!({ "job_id": job_id }),
        ))
        .await
    }
}

async fn fetch_item(
    conn: &mut SqliteConnection,
    id: QueueItemId,
) -> Result<Option<QueueItem>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1"
    ))
    .bind(id.to_string())
    .fetch_optional(conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_item", e))?;

    row.map(row_to_item).transpose()
}

fn decode_err(err: sqlx::Error) -> StoreError {
    map_sqlx_error("decode_queue_item", err)
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Map a database row into a `QueueItem`.
fn row_to_item(row: sqlx::sqlite::SqliteRow) -> Result<QueueItem, StoreError> {
    let id: String = row.try_get("id").map_err(decode_err)?;
    let entity_type: String = row.try_get("entity_type").map_err(decode_err)?;
    let operation: String = row.try_get("operation").map_err(decode_err)?;
    let payload: String = row.try_get("payload").map_err(decode_err)?;
    let media_key: Option<String> = row.try_get("media_key").map_err(decode_err)?;
    let status: String = row.try_get("status").map_err(decode_err)?;
    let failure_class: Option<String> = row.try_get("failure_class").map_err(decode_err)?;

    let enqueued_at: String = row.try_get("enqueued_at").map_err(decode_err)?;
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database {
            operation: "decode_queue_item",
            message: format!("invalid enqueued_at '{enqueued_at}': {e}"),
        })?;

    let retry_count: i64 = row.try_get("retry_count").map_err(decode_err)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(decode_err)?;
    let auto_retry_count: i64 = row.try_get("auto_retry_count").map_err(decode_err)?;
    let next_attempt_at: i64 = row.try_get("next_attempt_at").map_err(decode_err)?;

    Ok(QueueItem {
        id: id.parse()?,
        entity_type: entity_type.parse()?,
        entity_id: row.try_get("entity_id").map_err(decode_err)?,
        operation: operation.parse()?,
        payload: serde_json::from_str(&payload)?,
        media_key: media_key.map(|k| k.parse()).transpose()?,
        enqueued_at,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        auto_retry_count: auto_retry_count.max(0) as u32,
        next_attempt_at: millis_to_datetime(next_attempt_at),
        status: status.parse()?,
        last_error: row.try_get("last_error").map_err(decode_err)?,
        failure_class: failure_class.map(|c| c.parse()).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PhotoRecord;
    use crate::types::MediaReference;
    use serde_json::json;

    async fn queue(policy: RetryPolicy) -> MutationQueue {
        let store = LocalStore::open_in_memory(1 << 20).await.unwrap();
        MutationQueue::new(store, policy)
    }

    fn update(job: EntityId, title: &str) -> NewQueueItem {
        NewQueueItem::mutation(
            EntityType::Job,
            job,
            Operation::Update,
            json!({ "id": job, "title": title }),
        )
    }

    #[tokio::test]
    async fn identical_pending_updates_collapse_to_one_item() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let job = EntityId::new();

        let first = queue.enqueue(update(job, "Fix pump")).await.unwrap();
        let second = queue.enqueue(update(job, "Fix pump")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn superseding_update_replaces_the_pending_payload() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let job = EntityId::new();

        let first = queue.enqueue(update(job, "Fix pump")).await.unwrap();
        let second = queue.enqueue(update(job, "Replace pump")).await.unwrap();

        assert_eq!(first, second);
        let items = queue.list_all().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload["title"], "Replace pump");
    }

    #[tokio::test]
    async fn edits_during_an_in_flight_call_become_follow_ups() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let job = EntityId::new();

        let first = queue.enqueue(update(job, "v1")).await.unwrap();
        let in_flight = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(in_flight.id, first);

        let follow_up = queue.enqueue(update(job, "v2")).await.unwrap();
        assert_ne!(first, follow_up);

        // The in-flight snapshot is untouched.
        let stored = queue.get(first).await.unwrap().unwrap();
        assert_eq!(stored.payload["title"], "v1");
        assert_eq!(stored.status, QueueItemStatus::InFlight);

        // The follow-up waits until the in-flight item is gone.
        assert!(queue.dequeue_next().await.unwrap().is_none());
        queue.mark_succeeded(first).await.unwrap();
        let next = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(next.id, follow_up);
    }

    #[tokio::test]
    async fn dequeue_is_fifo_and_never_returns_in_flight_items() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let a = queue.enqueue(update(EntityId::new(), "a")).await.unwrap();
        let b = queue.enqueue(update(EntityId::new(), "b")).await.unwrap();

        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, a);
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, b);
        assert!(queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn collapse_does_not_jump_over_a_later_operation() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let job = EntityId::new();

        let first_update = queue.enqueue(update(job, "v1")).await.unwrap();
        queue.enqueue_seal(job).await.unwrap();
        let second_update = queue.enqueue(update(job, "v2")).await.unwrap();

        assert_ne!(first_update, second_update);
        let ops: Vec<_> = queue
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.operation)
            .collect();
        assert_eq!(ops, vec![Operation::Update, Operation::Seal, Operation::Update]);
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_fail_permanently() {
        let policy = RetryPolicy::new(2, Duration::from_secs(30), Duration::from_secs(60));
        let queue = queue(policy).await;
        let id = queue.enqueue(update(EntityId::new(), "x")).await.unwrap();

        queue.dequeue_next().await.unwrap().unwrap();
        let status = queue
            .mark_failed(id, FailureClass::Retryable, "connection reset")
            .await
            .unwrap();
        assert_eq!(status, Some(QueueItemStatus::Pending));

        // Backoff gate keeps it out of the next drain.
        assert!(queue.dequeue_next().await.unwrap().is_none());
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
        assert!(item.next_attempt_at > Utc::now() + chrono::Duration::seconds(20));

        let status = queue
            .mark_failed(id, FailureClass::Retryable, "connection reset again")
            .await
            .unwrap();
        assert_eq!(status, Some(QueueItemStatus::PermanentlyFailed));

        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.last_error.as_deref(), Some("connection reset again"));
        assert_eq!(queue.status_counts().await.unwrap(), QueueStatus { pending: 0, failed: 1 });
    }

    #[tokio::test]
    async fn permanent_failures_skip_the_retry_budget() {
        let queue = queue(RetryPolicy::immediate(5)).await;
        let id = queue.enqueue(update(EntityId::new(), "x")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        let status = queue
            .mark_failed(id, FailureClass::Permanent, "title too long")
            .await
            .unwrap();

        assert_eq!(status, Some(QueueItemStatus::PermanentlyFailed));
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.failure_class, Some(FailureClass::Permanent));
    }

    #[tokio::test]
    async fn failed_items_block_later_items_of_the_same_entity() {
        let queue = queue(RetryPolicy::immediate(1)).await;
        let job = EntityId::new();

        let update_id = queue.enqueue(update(job, "v1")).await.unwrap();
        let seal_id = queue.enqueue_seal(job).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        queue
            .mark_failed(update_id, FailureClass::Retryable, "offline")
            .await
            .unwrap();

        assert!(queue.dequeue_next().await.unwrap().is_none());

        assert!(queue.discard(update_id).await.unwrap());
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, seal_id);
    }

    #[tokio::test]
    async fn new_edit_revives_a_permanently_failed_item() {
        let queue = queue(RetryPolicy::immediate(1)).await;
        let job = EntityId::new();

        let id = queue.enqueue(update(job, "v1")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        queue
            .mark_failed(id, FailureClass::Permanent, "rejected")
            .await
            .unwrap();

        let revived = queue.enqueue(update(job, "v2")).await.unwrap();
        assert_eq!(revived, id);

        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.is_none());
        assert_eq!(item.payload["title"], "v2");
    }

    #[tokio::test]
    async fn upload_success_reclaims_blob_and_flags_photo() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let store = queue.store().clone();
        let key = MediaKey::new();
        let mut job = Job::new("Inspect roof");
        job.photos.push(PhotoRecord {
            media_key: key.clone(),
            content_type: "image/jpeg".to_string(),
            captured_at: Utc::now(),
            is_local_ref: true,
            remote_url: None,
        });
        store.put(Table::Jobs, &job.id.to_string(), &job).await.unwrap();
        store.put_blob(&key, b"jpeg", "image/jpeg").await.unwrap();

        let id = queue
            .enqueue(NewQueueItem::upload(MediaReference::new(
                key.clone(),
                job.id,
                "image/jpeg",
            )))
            .await
            .unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        // A failed upload keeps its blob.
        queue
            .mark_failed(id, FailureClass::Retryable, "timeout")
            .await
            .unwrap();
        assert!(store.get_blob(&key).await.unwrap().is_some());

        queue
            .mark_upload_succeeded(id, "https://cdn.example/p/1.jpg".to_string())
            .await
            .unwrap();

        assert!(queue.get(id).await.unwrap().is_none());
        assert!(store.get_blob(&key).await.unwrap().is_none());
        let job: Job = store
            .get(Table::Jobs, &job.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(!job.photos[0].is_local_ref);
        assert_eq!(
            job.photos[0].remote_url.as_deref(),
            Some("https://cdn.example/p/1.jpg")
        );
    }

    #[tokio::test]
    async fn failed_bucket_claims_are_exclusive() {
        let queue = queue(RetryPolicy::immediate(1)).await;
        let id = queue.enqueue(update(EntityId::new(), "x")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        queue
            .mark_failed(id, FailureClass::Permanent, "rejected")
            .await
            .unwrap();

        assert!(queue.claim_failed(id).await.unwrap().is_some());
        assert!(queue.claim_failed(id).await.unwrap().is_none());

        queue
            .release_failed(id, FailureClass::Retryable, "still down", true)
            .await
            .unwrap();
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::PermanentlyFailed);
        assert_eq!(item.auto_retry_count, 1);
        assert!(queue.failed_ids(Some(1)).await.unwrap().is_empty());
        assert_eq!(queue.failed_ids(None).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn stale_in_flight_items_return_to_pending() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let id = queue.enqueue(update(EntityId::new(), "x")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        assert_eq!(
            queue
                .requeue_stale_in_flight(Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );
        assert_eq!(queue.requeue_stale_in_flight(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn in_flight_items_cannot_be_discarded() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let id = queue.enqueue(update(EntityId::new(), "x")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        assert!(!queue.discard(id).await.unwrap());
        assert!(queue.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_checkout_puts_the_item_back() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let id = queue.enqueue(update(EntityId::new(), "Fix pump")).await.unwrap();

        let item = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::InFlight);
        drop(Checkout::new(&queue, &item, QueueItemStatus::Pending));

        let mut status = QueueItemStatus::InFlight;
        for _ in 0..100 {
            status = queue.get(id).await.unwrap().unwrap().status;
            if status != QueueItemStatus::InFlight {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, QueueItemStatus::Pending);
        assert_eq!(queue.dequeue_next().await.unwrap().map(|i| i.id), Some(id));
    }

    #[tokio::test]
    async fn settled_checkout_leaves_the_recorded_outcome() {
        let queue = queue(RetryPolicy::immediate(3)).await;
        let id = queue.enqueue(update(EntityId::new(), "Fix pump")).await.unwrap();

        let item = queue.dequeue_next().await.unwrap().unwrap();
        let checkout = Checkout::new(&queue, &item, QueueItemStatus::Pending);
        assert!(queue.mark_succeeded(id).await.unwrap());
        checkout.settle();

        tokio::task::yield_now().await;
        assert!(queue.get(id).await.unwrap().is_none());
    }
}
