//! Queue, progress and report types shared by every component of the sync core.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use fieldops_core::{DomainError, DomainResult, EntityId, MediaKey, QueueItemId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of record a queued mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Client,
    Technician,
    PhotoUpload,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Job => "job",
            EntityType::Client => "client",
            EntityType::Technician => "technician",
            EntityType::PhotoUpload => "photo_upload",
        }
    }

    /// REST collection the backend exposes for this type.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Job => "jobs",
            EntityType::Client => "clients",
            EntityType::Technician => "technicians",
            EntityType::PhotoUpload => "photos",
        }
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(EntityType::Job),
            "client" => Ok(EntityType::Client),
            "technician" => Ok(EntityType::Technician),
            "photo_upload" => Ok(EntityType::PhotoUpload),
            other => Err(DomainError::validation(format!("unknown entity type '{other}'"))),
        }
    }
}

/// Mutation applied to the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Upload,
    /// Evidence sealing of a job, queued like any other remote call.
    Seal,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Upload => "upload",
            Operation::Seal => "seal",
        }
    }
}

impl FromStr for Operation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "upload" => Ok(Operation::Upload),
            "seal" => Ok(Operation::Seal),
            other => Err(DomainError::validation(format!("unknown operation '{other}'"))),
        }
    }
}

/// Status of a queued item. Succeeded items are removed, so there is no variant for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    InFlight,
    PermanentlyFailed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::InFlight => "in_flight",
            QueueItemStatus::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl FromStr for QueueItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "in_flight" => Ok(QueueItemStatus::InFlight),
            "permanently_failed" => Ok(QueueItemStatus::PermanentlyFailed),
            other => Err(DomainError::validation(format!("unknown queue status '{other}'"))),
        }
    }
}

/// How a failed attempt is treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network unreachable, timeout, transient server error: back off and retry.
    Retryable,
    /// Validation rejection or conflict: needs user or auto-retry intervention.
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Retryable => "retryable",
            FailureClass::Permanent => "permanent",
        }
    }
}

impl FromStr for FailureClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(FailureClass::Retryable),
            "permanent" => Ok(FailureClass::Permanent),
            other => Err(DomainError::validation(format!("unknown failure class '{other}'"))),
        }
    }
}

/// Payload of a photo upload: a pointer at a locally stored blob, never the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    pub media_key: MediaKey,
    pub job_id: EntityId,
    pub content_type: String,
    pub is_local_ref: bool,
}

impl MediaReference {
    pub fn new(media_key: MediaKey, job_id: EntityId, content_type: impl Into<String>) -> Self {
        Self {
            media_key,
            job_id,
            content_type: content_type.into(),
            is_local_ref: true,
        }
    }
}

/// A mutation to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub media_key: Option<MediaKey>,
    /// Overrides the worker-tier retry cap for this item.
    pub max_retries: Option<u32>,
}

impl NewQueueItem {
    /// A create/update/delete/seal of a job, client or technician.
    pub fn mutation(
        entity_type: EntityType,
        entity_id: EntityId,
        operation: Operation,
        payload: Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
            payload,
            media_key: None,
            max_retries: None,
        }
    }

    /// Upload of a locally stored photo blob.
    pub fn upload(reference: MediaReference) -> Self {
        let media_key = reference.media_key.clone();
        Self {
            entity_type: EntityType::PhotoUpload,
            entity_id: media_key.to_string(),
            operation: Operation::Upload,
            payload: serde_json::to_value(&reference).unwrap_or(Value::Null),
            media_key: Some(media_key),
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Reject entity/operation combinations the backend has no endpoint for.
    pub fn validate(&self) -> DomainResult<()> {
        let uploads = self.entity_type == EntityType::PhotoUpload;
        match self.operation {
            Operation::Upload if !uploads => Err(DomainError::validation(format!(
                "upload is only valid for photo uploads, not {}",
                self.entity_type.as_str()
            ))),
            Operation::Upload => {
                if self.media_key.is_none() {
                    return Err(DomainError::validation("photo upload without media reference"));
                }
                if self.payload.get("is_local_ref") != Some(&Value::Bool(true)) {
                    return Err(DomainError::validation(
                        "photo upload payload must hold a local media reference, not inline bytes",
                    ));
                }
                Ok(())
            }
            _ if uploads => Err(DomainError::validation(format!(
                "photo uploads only support the upload operation, not {}",
                self.operation.as_str()
            ))),
            Operation::Seal if self.entity_type != EntityType::Job => Err(
                DomainError::validation("only jobs can be sealed"),
            ),
            _ => {
                EntityId::from_str(&self.entity_id)?;
                Ok(())
            }
        }
    }
}

/// A unit of pending work, as persisted in the queue table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub media_key: Option<MediaKey>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub auto_retry_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: QueueItemStatus,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
}

impl QueueItem {
    /// Human readable label for failure summaries: the payload's name or title, else the id.
    pub fn display_name(&self) -> String {
        ["name", "title"]
            .iter()
            .find_map(|field| {
                self.payload
                    .get(*field)
                    .and_then(Value::as_str)
                    .filter(|name| !name.trim().is_empty())
            })
            .map(str::to_string)
            .unwrap_or_else(|| self.entity_id.clone())
    }

    pub fn media_reference(&self) -> Option<MediaReference> {
        if self.entity_type != EntityType::PhotoUpload {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Pending/failed counts shown by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Pending plus in-flight items.
    pub pending: usize,
    pub failed: usize,
}

/// Permanently failed items, bounded to a display limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedItems {
    pub items: Vec<QueueItem>,
    /// Number of failed items not included in `items`.
    pub overflow: usize,
}

/// Progress of an auto-retry run (local, or observed from another instance).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRetryProgress {
    pub total: usize,
    pub recovered: usize,
    pub is_running: bool,
}

/// Result of a user-triggered "Retry All".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAllOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Another run already owns the failed bucket; nothing was attempted.
    pub already_syncing: bool,
    pub message: Option<String>,
}

impl RetryAllOutcome {
    pub fn already_syncing() -> Self {
        Self {
            already_syncing: true,
            message: Some("already syncing: a background retry is in progress".to_string()),
            ..Default::default()
        }
    }
}

/// Outcome of one drain pass of the sync worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub permanently_failed: usize,
    /// The reachability check failed; nothing was attempted.
    pub offline: bool,
    /// The batch stopped early after a network failure.
    pub interrupted: bool,
    /// Another drain pass of this instance was already running.
    pub already_running: bool,
}
