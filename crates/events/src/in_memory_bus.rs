//! In-process message bus (instances sharing one process, tests/dev).

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use crate::bus::{BusError, MessageBus, Subscription};

/// In-memory topic pub/sub.
///
/// - No IO / no async
/// - Best-effort fan-out per topic
#[derive(Debug)]
pub struct InMemoryMessageBus<M> {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<M>>>>,
}

impl<M> InMemoryMessageBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M> Default for InMemoryMessageBus<M> {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> MessageBus<M> for InMemoryMessageBus<M>
where
    M: Clone + Send + 'static,
{
    fn publish(&self, topic: &str, message: M) -> Result<(), BusError> {
        let mut topics = self.topics.lock().map_err(|_| BusError::Poisoned)?;

        if let Some(subs) = topics.get_mut(topic) {
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        } else {
            tracing::trace!(topic, "published to topic without subscribers");
        }

        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut topics) = self.topics.lock() {
            topics.entry(topic.to_string()).or_default().push(tx);
        }

        Subscription::new(rx)
    }
}
