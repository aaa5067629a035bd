//! Message publishing/subscription abstraction (mechanics only).
//!
//! Instances of the field client running side by side on one device use the bus to
//! tell each other what they are doing ("sync started", progress, "sync finished").
//! The bus only distributes notifications; it never owns state, and a missed message
//! must never break correctness. Authoritative state (queue rows, the sync lease)
//! lives in the local store.
//!
//! ## Delivery
//!
//! - **Topic-scoped**: a subscriber receives only the messages published to its topic
//! - **Broadcast**: every subscriber of a topic gets its own copy
//! - **Best-effort**: subscribers that went away are dropped silently
//!
//! Implementations may sit on in-process channels, UNIX domain sockets, OS pipes or
//! anything else that can fan a message out.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// A subscription to one topic.
///
/// ```ignore
/// let subscription = bus.subscribe("sync");
///
/// while let Ok(signal) = subscription.try_recv() {
///     observe(signal);
/// }
/// ```
///
/// Subscriptions are designed for single-consumer use.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every message currently buffered, oldest first.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Publish failed due to internal lock poisoning.
    #[error("message bus lock poisoned")]
    Poisoned,
    /// The underlying transport is gone.
    #[error("message bus transport closed: {0}")]
    Closed(String),
}

/// Transport-agnostic pub/sub.
///
/// The trait requires `Send + Sync`; publishers on different tasks may publish
/// concurrently.
pub trait MessageBus<M>: Send + Sync {
    fn publish(&self, topic: &str, message: M) -> Result<(), BusError>;

    fn subscribe(&self, topic: &str) -> Subscription<M>;
}

impl<M, B> MessageBus<M> for Arc<B>
where
    B: MessageBus<M> + ?Sized,
{
    fn publish(&self, topic: &str, message: M) -> Result<(), BusError> {
        (**self).publish(topic, message)
    }

    fn subscribe(&self, topic: &str) -> Subscription<M> {
        (**self).subscribe(topic)
    }
}
