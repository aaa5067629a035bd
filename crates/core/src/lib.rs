//! `fieldops-core`: shared identifiers and the validation error model.
//!
//! This crate contains **pure domain** primitives (no storage or network concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{EntityId, InstanceId, MediaKey, QueueItemId};
