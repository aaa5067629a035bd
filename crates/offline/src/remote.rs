//! Remote backend API consumed by the sync core.
//!
//! The backend is only reached through [`RemoteApi`]; [`HttpRemoteApi`] is the
//! `reqwest` implementation used by the daemon.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::entities::SealReceipt;
use crate::store::MediaBlob;
use crate::types::{EntityType, FailureClass, MediaReference};

/// Why the backend refused to seal or verify a job's evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SealFailure {
    SealNotFound,
    HashMismatch,
    InvalidSignature,
}

impl SealFailure {
    pub fn code(&self) -> &'static str {
        match self {
            SealFailure::SealNotFound => "SEAL_NOT_FOUND",
            SealFailure::HashMismatch => "HASH_MISMATCH",
            SealFailure::InvalidSignature => "INVALID_SIGNATURE",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SEAL_NOT_FOUND" => Some(SealFailure::SealNotFound),
            "HASH_MISMATCH" => Some(SealFailure::HashMismatch),
            "INVALID_SIGNATURE" => Some(SealFailure::InvalidSignature),
            _ => None,
        }
    }
}

impl std::fmt::Display for SealFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("rejected by server ({status}): {reason}")]
    Validation { status: u16, reason: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("seal rejected: {0}")]
    Seal(SealFailure),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Error body returned by the backend: `{ "code": "...", "message": "..." }`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RemoteError {
    /// Map a non-success HTTP response.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        if let Some(failure) = parsed.code.as_deref().and_then(SealFailure::from_code) {
            return RemoteError::Seal(failure);
        }

        let message = parsed
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| body.trim().to_string());

        match status {
            409 => RemoteError::Conflict(message),
            408 | 429 | 500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Validation {
                status,
                reason: message,
            },
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::Server { .. } => {
                FailureClass::Retryable
            }
            RemoteError::Validation { .. }
            | RemoteError::Conflict(_)
            | RemoteError::Seal(_)
            | RemoteError::Decode(_) => FailureClass::Permanent,
        }
    }

    /// The backend could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout)
    }

    fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Validation { status: 404, .. })
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

/// Remote backend operations used to apply queued mutations.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError>;

    async fn update_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError>;

    /// Deleting an entity the backend no longer has counts as success.
    async fn delete_entity(&self, entity_type: EntityType, entity_id: &str)
    -> Result<(), RemoteError>;

    /// Upload a photo blob; returns the remote URL.
    async fn upload_media(
        &self,
        reference: &MediaReference,
        blob: &MediaBlob,
    ) -> Result<String, RemoteError>;

    async fn seal(&self, job_id: &str) -> Result<SealReceipt, RemoteError>;

    async fn verify(&self, job_id: &str) -> Result<SealReceipt, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// `reqwest` client for the FieldOps REST API.
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpRemoteApi {
    pub fn new(
        api_url: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };

        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::from_response(status, &body))
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!("/api/{}", entity_type.collection()));
        tracing::debug!(entity_id, "POST {url}");
        self.send(self.client.post(&url).json(payload)).await?;
        Ok(())
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!("/api/{}/{}", entity_type.collection(), entity_id));
        tracing::debug!("PUT {url}");
        self.send(self.client.put(&url).json(payload)).await?;
        Ok(())
    }

    async fn delete_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!("/api/{}/{}", entity_type.collection(), entity_id));
        tracing::debug!("DELETE {url}");
        match self.send(self.client.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::debug!(entity_id, "entity already gone on the backend");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn upload_media(
        &self,
        reference: &MediaReference,
        blob: &MediaBlob,
    ) -> Result<String, RemoteError> {
        let url = self.url(&format!(
            "/api/jobs/{}/photos/{}",
            reference.job_id, reference.media_key
        ));
        tracing::debug!(bytes = blob.bytes.len(), "POST {url}");

        let resp = self
            .send(
                self.client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, blob.content_type.as_str())
                    .body(blob.bytes.clone()),
            )
            .await?;

        let body: UploadResponse = resp.json().await?;
        Ok(body.url)
    }

    async fn seal(&self, job_id: &str) -> Result<SealReceipt, RemoteError> {
        let url = self.url(&format!("/api/jobs/{job_id}/seal"));
        tracing::debug!("POST {url}");
        let resp = self.send(self.client.post(&url)).await?;
        Ok(resp.json().await?)
    }

    async fn verify(&self, job_id: &str) -> Result<SealReceipt, RemoteError> {
        let url = self.url(&format!("/api/jobs/{job_id}/verify"));
        tracing::debug!("GET {url}");
        let resp = self.send(self.client.get(&url)).await?;
        Ok(resp.json().await?)
    }
}
