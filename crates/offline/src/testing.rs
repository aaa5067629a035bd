//! In-memory backend double for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::entities::SealReceipt;
use crate::remote::{RemoteApi, RemoteError};
use crate::store::MediaBlob;
use crate::types::{EntityType, MediaReference, Operation};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AppliedCall {
    pub operation: Operation,
    pub entity_id: String,
    pub payload: Option<Value>,
}

#[derive(Debug, Default)]
struct Script {
    failures: HashMap<String, VecDeque<RemoteError>>,
    fail_all: Option<RemoteError>,
    applied: Vec<AppliedCall>,
    records: HashMap<String, Value>,
}

/// Backend that applies every call unless told to fail it.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRemote {
    script: Mutex<Script>,
}

impl ScriptedRemote {
    /// Fail the next call for `entity_id` with `err`.
    pub fn fail_next(&self, entity_id: &str, err: RemoteError) {
        let mut script = self.script.lock().unwrap();
        script
            .failures
            .entry(entity_id.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn fail_all(&self, err: RemoteError) {
        self.script.lock().unwrap().fail_all = Some(err);
    }

    pub fn succeed_all(&self) {
        let mut script = self.script.lock().unwrap();
        script.fail_all = None;
        script.failures.clear();
    }

    pub fn applied(&self) -> Vec<AppliedCall> {
        self.script.lock().unwrap().applied.clone()
    }

    pub fn record(&self, entity_id: &str) -> Option<Value> {
        self.script.lock().unwrap().records.get(entity_id).cloned()
    }

    fn call(
        &self,
        operation: Operation,
        entity_id: &str,
        payload: Option<&Value>,
    ) -> Result<(), RemoteError> {
        let mut script = self.script.lock().unwrap();
        if let Some(err) = script
            .failures
            .get_mut(entity_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if let Some(err) = script.fail_all.clone() {
            return Err(err);
        }

        match (operation, payload) {
            (Operation::Delete, _) => {
                script.records.remove(entity_id);
            }
            (_, Some(payload)) => {
                script.records.insert(entity_id.to_string(), payload.clone());
            }
            _ => {}
        }
        script.applied.push(AppliedCall {
            operation,
            entity_id: entity_id.to_string(),
            payload: payload.cloned(),
        });
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn create_entity(
        &self,
        _entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        self.call(Operation::Create, entity_id, Some(payload))
    }

    async fn update_entity(
        &self,
        _entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        self.call(Operation::Update, entity_id, Some(payload))
    }

    async fn delete_entity(
        &self,
        _entity_type: EntityType,
        entity_id: &str,
    ) -> Result<(), RemoteError> {
        self.call(Operation::Delete, entity_id, None)
    }

    async fn upload_media(
        &self,
        reference: &MediaReference,
        _blob: &MediaBlob,
    ) -> Result<String, RemoteError> {
        let key = reference.media_key.to_string();
        self.call(Operation::Upload, &key, None)?;
        Ok(format!("https://cdn.fieldops.test/{key}"))
    }

    async fn seal(&self, job_id: &str) -> Result<SealReceipt, RemoteError> {
        self.call(Operation::Seal, job_id, None)?;
        Ok(SealReceipt {
            hash: format!("sha256:{job_id}"),
            signature: "sig".to_string(),
            sealed_at: Utc::now(),
        })
    }

    async fn verify(&self, job_id: &str) -> Result<SealReceipt, RemoteError> {
        let script = self.script.lock().unwrap();
        if let Some(err) = script.fail_all.clone() {
            return Err(err);
        }
        let sealed = script
            .applied
            .iter()
            .any(|c| c.operation == Operation::Seal && c.entity_id == job_id);
        if !sealed {
            return Err(RemoteError::Seal(crate::remote::SealFailure::SealNotFound));
        }
        Ok(SealReceipt {
            hash: format!("sha256:{job_id}"),
            signature: "sig".to_string(),
            sealed_at: Utc::now(),
        })
    }
}
