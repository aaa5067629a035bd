//! Entity snapshots owned by the local store.

use chrono::{DateTime, Utc};
use fieldops_core::{DomainError, DomainResult, EntityId, MediaKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::Table;
use crate::types::EntityType;

/// A record persisted in one of the entity tables and mirrored to the backend.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> EntityId;

    /// Reject snapshots the backend would never accept.
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Scheduled,
    InProgress,
    Completed,
    Invoiced,
}

/// A photo attached to a job. Until uploaded it points at a local blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub media_key: MediaKey,
    pub content_type: String,
    pub captured_at: DateTime<Utc>,
    pub is_local_ref: bool,
    pub remote_url: Option<String>,
}

/// Result of sealing a job's evidence on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealReceipt {
    pub hash: String,
    pub signature: String,
    pub sealed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: EntityId,
    pub title: String,
    pub client_id: Option<EntityId>,
    pub technician_id: Option<EntityId>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub photos: Vec<PhotoRecord>,
    #[serde(default)]
    pub seal: Option<SealReceipt>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            title: title.into(),
            client_id: None,
            technician_id: None,
            status: JobStatus::Scheduled,
            notes: String::new(),
            photos: Vec::new(),
            seal: None,
            updated_at: Utc::now(),
        }
    }

    pub fn photo_mut(&mut self, key: &MediaKey) -> Option<&mut PhotoRecord> {
        self.photos.iter_mut().find(|p| &p.media_key == key)
    }
}

impl Record for Job {
    const TABLE: Table = Table::Jobs;
    const ENTITY_TYPE: EntityType = EntityType::Job;

    fn id(&self) -> EntityId {
        self.id
    }

    fn validate(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::validation("job title must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: EntityId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl Client {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            email: None,
            phone: None,
            address: None,
        }
    }
}

impl Record for Client {
    const TABLE: Table = Table::Clients;
    const ENTITY_TYPE: EntityType = EntityType::Client;

    fn id(&self) -> EntityId {
        self.id
    }

    fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("client name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technician {
    pub id: EntityId,
    pub name: String,
    pub phone: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Technician {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            phone: None,
            active: true,
        }
    }
}

impl Record for Technician {
    const TABLE: Table = Table::Technicians;
    const ENTITY_TYPE: EntityType = EntityType::Technician;

    fn id(&self) -> EntityId {
        self.id
    }

    fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("technician name must not be empty"));
        }
        Ok(())
    }
}
