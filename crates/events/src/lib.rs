//! Topic-based publish/subscribe used to signal between client instances.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{BusError, MessageBus, Subscription};
pub use in_memory_bus::InMemoryMessageBus;
