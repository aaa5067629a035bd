//! Errors surfaced to callers of the sync facade.

use fieldops_core::DomainError;
use thiserror::Error;

use crate::remote::RemoteError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("backend is unreachable")]
    Offline,
}

impl SyncError {
    /// The device or the media quota is full; the user has to free space.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, SyncError::Storage(err) if err.is_quota_exceeded())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
