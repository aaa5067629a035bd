//! `fieldops-offline`
//!
//! **Responsibility:** offline durable sync of the field client.
//!
//! This crate provides:
//! - A SQLite-backed local store (records, drafts, media blobs) with scoped transactions
//! - A durable mutation queue with per-entity FIFO and payload collapsing
//! - A sync worker draining pending items with bounded, backed-off retries
//! - An auto-retry engine for permanently failed items, coordinated across instances
//! - A read-only status surface for the UI
//!
//! The backend stays the authority; every local write is replayed to it through
//! the queue (last writer wins per entity).

pub mod auto_retry;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod entities;
pub mod error;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod service;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use auto_retry::{AutoRetryEngine, AutoRetryRun, AutoRetryState};
pub use config::{AutoRetryConfig, ConfigError, SyncConfig};
pub use connectivity::{ConnectivityProbe, ConnectivityState, HttpProbe, ManualProbe};
pub use coordinator::{CrossInstanceCoordinator, LeaseGuard, SYNC_TOPIC, SyncSignal};
pub use entities::{Client, Job, JobStatus, PhotoRecord, Record, SealReceipt, Technician};
pub use error::{SyncError, SyncResult};
pub use queue::{Completion, MutationQueue};
pub use remote::{HttpRemoteApi, RemoteApi, RemoteError, SealFailure};
pub use retry::RetryPolicy;
pub use service::{OfflineSync, RunningSync};
pub use status::{StatusPoller, StatusSnapshot, StatusSurface};
pub use store::{LocalStore, MediaBlob, StoreError, StoreTx, Table, TxFuture, default_db_path};
pub use types::{
    AutoRetryProgress, DrainReport, EntityType, FailedItems, FailureClass, MediaReference,
    NewQueueItem, Operation, QueueItem, QueueItemStatus, QueueStatus, RetryAllOutcome,
};
pub use worker::SyncWorker;
