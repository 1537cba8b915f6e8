//! Relaypoint delay queue
//!
//! - MessageQueue: delay-ordered multi-consumer queue of pending sends
//! - MessagePersister: storage seam for queued units, with no-op and in-memory backends

pub mod message_queue;
pub mod persister;

pub use message_queue::MessageQueue;
pub use persister::{MessagePersister, NoOpMessagePersister, InMemoryMessagePersister};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue {0} no longer accepts messages")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
