//! Relaypoint Message Router
//!
//! This crate provides the message routing state machine with:
//! - MessageRouter: validation, access control, fan-out, retry and completion tracking
//! - SendWorkerPool: fixed set of workers draining the delay queue
//! - MessagingStub: uniform transmit contract over transports, looked up by address kind
//! - DeliveryHandle: single-use completion signal for one transmit attempt
//! - Lifecycle: routing-table sweep and shutdown coordination

pub mod error;
pub mod stub;
pub mod access_control;
pub mod listener;
pub mod pool;
pub mod lifecycle;
pub mod router;
pub mod router_metrics;

pub use error::RouterError;
pub use stub::{
    AttemptOutcome, DeliveryHandle, MessagingStub, MessagingStubFactory, MessagingStubRegistry,
    InProcessMessagingStubFactory,
};
pub use access_control::AccessController;
pub use listener::MessageProcessedListener;
pub use pool::SendWorkerPool;
pub use lifecycle::{LifecycleManager, ShutdownListener, ShutdownNotifier};
pub use router::{MessageRouter, RouterComponents, next_retry_delay_ms};

pub type Result<T> = std::result::Result<T, RouterError>;
