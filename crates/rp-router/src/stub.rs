//! Transport stubs and per-attempt completion handles

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rp_common::{Address, AddressKind, ImmutableMessage, TransportError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Result of one transmit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Failed(TransportError),
}

struct HandleInner {
    message_id: String,
    completed: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<AttemptOutcome>>>,
}

/// Completion signal for a single transmit attempt.
///
/// Only the first call to `succeed` or `fail` counts; later calls are logged
/// and return false. Dropping every clone without completing reports the
/// attempt as transiently failed.
#[derive(Clone)]
pub struct DeliveryHandle {
    inner: Arc<HandleInner>,
}

impl DeliveryHandle {
    pub fn new(message_id: impl Into<String>) -> (Self, oneshot::Receiver<AttemptOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            inner: Arc::new(HandleInner {
                message_id: message_id.into(),
                completed: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            }),
        };
        (handle, rx)
    }

    pub fn succeed(&self) -> bool {
        self.complete(AttemptOutcome::Delivered)
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.complete(AttemptOutcome::Failed(error))
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    fn complete(&self, outcome: AttemptOutcome) -> bool {
        if self
            .inner
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                message_id = %self.inner.message_id,
                outcome = ?outcome,
                "Ignoring completion of an already completed attempt"
            );
            return false;
        }

        if let Some(tx) = self.inner.tx.lock().take() {
            // receiver gone means the router no longer waits for this attempt
            let _ = tx.send(outcome);
        }
        true
    }
}

/// Sends a message over one concrete transport.
///
/// Implementations report the outcome through `handle`, either before
/// returning or later from another task. Returning an error is equivalent
/// to `handle.fail(error)`.
#[async_trait]
pub trait MessagingStub: Send + Sync {
    async fn transmit(
        &self,
        message: Arc<ImmutableMessage>,
        handle: DeliveryHandle,
    ) -> std::result::Result<(), TransportError>;
}

pub trait MessagingStubFactory: Send + Sync {
    /// None when no stub can reach this address.
    fn create(&self, address: &Address) -> Option<Arc<dyn MessagingStub>>;
}

/// Stub factories keyed by address kind.
#[derive(Default)]
pub struct MessagingStubRegistry {
    factories: HashMap<AddressKind, Arc<dyn MessagingStubFactory>>,
}

impl MessagingStubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, kind: AddressKind, factory: Arc<dyn MessagingStubFactory>) -> Self {
        self.register(kind, factory);
        self
    }

    pub fn register(&mut self, kind: AddressKind, factory: Arc<dyn MessagingStubFactory>) {
        if self.factories.insert(kind, factory).is_some() {
            warn!(kind = ?kind, "Replaced messaging stub factory");
        }
    }

    pub fn create(&self, address: &Address) -> Option<Arc<dyn MessagingStub>> {
        self.factories.get(&address.kind()).and_then(|factory| factory.create(address))
    }
}

// ============================================================================
// In-process delivery
// ============================================================================

/// Delivers messages for in-process addresses to channels registered per id.
#[derive(Default)]
pub struct InProcessMessagingStubFactory {
    receivers: Arc<DashMap<String, mpsc::UnboundedSender<Arc<ImmutableMessage>>>>,
}

impl InProcessMessagingStubFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the receiving end for `InProcess { id }` and returns its inbox.
    pub fn register_receiver(&self, id: impl Into<String>) -> mpsc::UnboundedReceiver<Arc<ImmutableMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.receivers.insert(id.into(), tx);
        rx
    }

    pub fn unregister_receiver(&self, id: &str) {
        self.receivers.remove(id);
    }
}

struct InProcessMessagingStub {
    id: String,
    receivers: Arc<DashMap<String, mpsc::UnboundedSender<Arc<ImmutableMessage>>>>,
}

#[async_trait]
impl MessagingStub for InProcessMessagingStub {
    async fn transmit(
        &self,
        message: Arc<ImmutableMessage>,
        handle: DeliveryHandle,
    ) -> std::result::Result<(), TransportError> {
        let sender = self
            .receivers
            .get(&self.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::NotSent(format!("no in-process receiver {}", self.id)))?;

        sender
            .send(message)
            .map_err(|_| TransportError::NotSent(format!("in-process receiver {} closed", self.id)))?;
        handle.succeed();
        Ok(())
    }
}

impl MessagingStubFactory for InProcessMessagingStubFactory {
    fn create(&self, address: &Address) -> Option<Arc<dyn MessagingStub>> {
        match address {
            Address::InProcess { id } => Some(Arc::new(InProcessMessagingStub {
                id: id.clone(),
                receivers: self.receivers.clone(),
            })),
            _ => None,
        }
    }
}
