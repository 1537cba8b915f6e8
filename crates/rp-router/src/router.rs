//! MessageRouter - the routing state machine
//!
//! `route` validates a message, optionally checks access on a separate task,
//! resolves its recipients and queues one unit per recipient. Workers send
//! units through transport stubs; failed attempts are retried with
//! exponential backoff until they succeed, turn fatal, run out of retries or
//! expire. Listeners hear about each routed message exactly once.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use rp_common::{DelayableMessage, ImmutableMessage, MessageType, RouteHolder, TransportError};
use rp_config::RouterSettings;
use rp_queue::MessageQueue;
use rp_routing::{AddressManager, RoutingTable};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access_control::AccessController;
use crate::error::RouterError;
use crate::lifecycle::{LifecycleManager, ShutdownListener};
use crate::listener::{ListenerRegistry, MessageProcessedListener};
use crate::pool::SendWorkerPool;
use crate::router_metrics;
use crate::stub::{AttemptOutcome, DeliveryHandle, MessagingStubRegistry};
use crate::Result;

/// Delay before the next attempt.
///
/// The backoff starts at `base_ms` and doubles with every retry. A delay
/// suggested by the transport is honoured when it is longer. `cap_ms`, when
/// set, bounds the result.
pub fn next_retry_delay_ms(
    last_delay_ms: u64,
    suggested_delay_ms: Option<u64>,
    base_ms: u64,
    cap_ms: Option<u64>,
) -> u64 {
    let backoff = if last_delay_ms == 0 {
        base_ms
    } else {
        last_delay_ms.saturating_mul(2)
    };
    let delay = suggested_delay_ms.map_or(backoff, |suggested| suggested.max(backoff));
    cap_ms.map_or(delay, |cap| delay.min(cap))
}

/// Collaborators the router is wired with.
pub struct RouterComponents {
    pub routing_table: Arc<dyn RoutingTable>,
    pub address_manager: Arc<AddressManager>,
    pub message_queue: Arc<MessageQueue>,
    pub stub_registry: MessagingStubRegistry,
    pub access_controller: Option<Arc<dyn AccessController>>,
}

/// Completion bookkeeping for one `route` call.
struct MessageTracker {
    message_id: String,
    pending_units: AtomicUsize,
    /// Participant whose routing entry this message holds a reference on.
    ref_holder: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum UnitOutcome {
    Delivered,
    Dropped(&'static str),
}

pub struct MessageRouter {
    settings: RouterSettings,
    routing_table: Arc<dyn RoutingTable>,
    address_manager: Arc<AddressManager>,
    queue: Arc<MessageQueue>,
    stubs: MessagingStubRegistry,
    access_controller: Option<Arc<dyn AccessController>>,

    listeners: ListenerRegistry,

    /// Trackers by tracking id; message ids may repeat across calls.
    trackers: DashMap<String, Arc<MessageTracker>>,

    /// Accepted messages without a terminal outcome yet
    in_flight: AtomicUsize,

    /// Units inside `MessagingStub::transmit`, by attempt id. Whoever removes
    /// an entry owns finishing or retrying that unit.
    sending: DashMap<u64, DelayableMessage>,
    next_attempt: AtomicU64,

    shutting_down: AtomicBool,
    pool: SendWorkerPool,
    lifecycle: Mutex<Option<LifecycleManager>>,
}

impl MessageRouter {
    pub fn new(settings: RouterSettings, components: RouterComponents) -> Result<Arc<Self>> {
        settings.validate()?;
        if settings.access_control_enabled && components.access_controller.is_none() {
            return Err(RouterError::MissingAccessController);
        }

        let pool = SendWorkerPool::new(settings.max_parallel_sends);

        Ok(Arc::new(Self {
            settings,
            routing_table: components.routing_table,
            address_manager: components.address_manager,
            queue: components.message_queue,
            stubs: components.stub_registry,
            access_controller: components.access_controller,
            listeners: ListenerRegistry::default(),
            trackers: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            sending: DashMap::new(),
            next_attempt: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            pool,
            lifecycle: Mutex::new(None),
        }))
    }

    /// Restores persisted units, then starts the send workers and the
    /// routing-table sweep.
    pub async fn start(self: &Arc<Self>) {
        if self.pool.is_running() {
            return;
        }

        for unit in self.queue.restore_persisted().await {
            self.track_restored(&unit);
        }

        let router = self.clone();
        self.pool.start(self.queue.clone(), move |unit| {
            let router = router.clone();
            async move { router.send(unit).await }
        });

        *self.lifecycle.lock() = Some(LifecycleManager::start(
            self.routing_table.clone(),
            self.settings.routing_table_cleanup_interval(),
        ));

        info!(
            max_parallel_sends = self.settings.max_parallel_sends,
            access_control = self.settings.access_control_enabled,
            "Message router started"
        );
    }

    /// Accepts a message for delivery.
    ///
    /// Only validation failures and calls during shutdown return an error;
    /// every other outcome is reported to message-processed listeners.
    pub async fn route(self: &Arc<Self>, message: ImmutableMessage) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.reject(&message.id, "shutdown");
            return Err(RouterError::ShutdownInProgress);
        }
        if !message.ttl_absolute {
            self.reject(&message.id, "relative_ttl");
            return Err(RouterError::RelativeTtl { message_id: message.id });
        }
        if message.is_expired() {
            self.reject(&message.id, "expired");
            return Err(RouterError::MessageExpired {
                message_id: message.id,
                expiry_ms: message.ttl_ms,
            });
        }

        router_metrics::record_routed();
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        router_metrics::set_in_flight(in_flight);

        let message = Arc::new(message);
        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            sender = %message.sender,
            recipient = %message.recipient,
            "Routing message"
        );

        match (&self.access_controller, self.settings.access_control_enabled) {
            (Some(controller), true) => {
                let router = self.clone();
                let controller = controller.clone();
                tokio::spawn(async move {
                    router.check_access_then_dispatch(controller, message).await;
                });
            }
            _ => self.dispatch(message).await,
        }
        Ok(())
    }

    pub fn register_message_processed_listener(&self, listener: Arc<dyn MessageProcessedListener>) {
        self.listeners.register(listener);
    }

    pub fn unregister_message_processed_listener(&self, listener: &Arc<dyn MessageProcessedListener>) {
        self.listeners.unregister(listener);
    }

    /// Marks a participant as known without giving it a route.
    pub fn set_to_known(&self, participant_id: &str) {
        self.routing_table.set_to_known(participant_id);
    }

    /// Messages accepted by `route` that have not reached a terminal outcome.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn routing_table(&self) -> &Arc<dyn RoutingTable> {
        &self.routing_table
    }

    pub fn address_manager(&self) -> &Arc<AddressManager> {
        &self.address_manager
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Drains the queue for at most the configured timeout, drops whatever
    /// is left and stops the workers.
    pub async fn shutdown(&self) {
        self.drain_for_shutdown().await;
        self.stop().await;
    }

    // ========================================================================
    // Intake
    // ========================================================================

    fn reject(&self, message_id: &str, reason: &'static str) {
        warn!(message_id = %message_id, reason, "Rejecting message");
        router_metrics::record_dropped(reason);
        self.listeners.notify(message_id);
    }

    async fn check_access_then_dispatch(
        self: Arc<Self>,
        controller: Arc<dyn AccessController>,
        message: Arc<ImmutableMessage>,
    ) {
        // a separate task so a panicking check surfaces as a JoinError
        let check = {
            let message = message.clone();
            tokio::spawn(async move { controller.has_consumer_permission(&message).await })
        };

        match check.await {
            Ok(Ok(true)) => self.dispatch(message).await,
            Ok(Ok(false)) => self.drop_message(&message, "access_denied"),
            Ok(Err(e)) => {
                warn!(message_id = %message.id, error = %e, "Access check failed");
                self.drop_message(&message, "access_check_failed");
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Access check aborted");
                self.drop_message(&message, "access_check_failed");
            }
        }
    }

    async fn dispatch(&self, message: Arc<ImmutableMessage>) {
        let recipients = self.address_manager.participant_ids_for_message(&message);
        if recipients.is_empty() {
            self.drop_message(&message, "no_recipients");
            return;
        }

        let ref_holder = match self.reference_holder(&message) {
            Some(participant_id) if self.routing_table.increment_reference_count(&participant_id) => {
                Some(participant_id)
            }
            Some(participant_id) => {
                debug!(
                    message_id = %message.id,
                    participant_id = %participant_id,
                    "No routing entry to hold for message"
                );
                None
            }
            None => None,
        };

        let tracking_id = Uuid::new_v4().to_string();
        self.trackers.insert(
            tracking_id.clone(),
            Arc::new(MessageTracker {
                message_id: message.id.clone(),
                pending_units: AtomicUsize::new(recipients.len()),
                ref_holder,
            }),
        );

        for recipient in recipients {
            let unit = DelayableMessage::new(message.clone(), recipient, tracking_id.clone(), 0);
            if let Err(e) = self.queue.put(unit.clone()).await {
                debug!(message_id = %message.id, error = %e, "Could not queue message");
                self.finish_unit(&unit, UnitOutcome::Dropped("shutdown"));
            }
        }
    }

    /// Participant whose route must stay alive while `message` is in flight.
    fn reference_holder(&self, message: &ImmutableMessage) -> Option<String> {
        match message.message_type.route_holder() {
            RouteHolder::Sender => Some(message.sender.clone()),
            RouteHolder::Recipient => {
                let in_process_provider = message.message_type == MessageType::SubscriptionReply
                    && self
                        .routing_table
                        .get(&message.sender)
                        .map_or(false, |address| address.is_in_process());
                (!in_process_provider).then(|| message.recipient.clone())
            }
            RouteHolder::None => None,
        }
    }

    fn track_restored(&self, unit: &DelayableMessage) {
        let tracker = self
            .trackers
            .entry(unit.tracking_id().to_string())
            .or_insert_with(|| {
                let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                router_metrics::set_in_flight(in_flight);
                Arc::new(MessageTracker {
                    message_id: unit.message().id.clone(),
                    pending_units: AtomicUsize::new(0),
                    ref_holder: None,
                })
            })
            .clone();
        tracker.pending_units.fetch_add(1, Ordering::SeqCst);
    }

    // ========================================================================
    // Sending
    // ========================================================================

    async fn send(self: &Arc<Self>, unit: DelayableMessage) {
        let message = unit.message().clone();

        if message.is_expired() {
            self.finish_unit(&unit, UnitOutcome::Dropped("expired"));
            return;
        }

        let address = match self.address_manager.address_for_message(&unit) {
            Some(address) => address,
            None if message.message_type.retries_unresolved_address() => {
                let error = TransportError::Unavailable(format!("no address for {}", unit.recipient()));
                self.handle_failure(unit, error).await;
                return;
            }
            None => {
                self.finish_unit(&unit, UnitOutcome::Dropped("unroutable"));
                return;
            }
        };

        let stub = match self.stubs.create(&address) {
            Some(stub) => stub,
            None => {
                warn!(
                    message_id = %message.id,
                    address = %address,
                    "No messaging stub for address kind"
                );
                self.finish_unit(&unit, UnitOutcome::Dropped("no_stub"));
                return;
            }
        };

        debug!(
            message_id = %message.id,
            recipient = %unit.recipient(),
            address = %address,
            attempt = unit.retry_count() + 1,
            "Transmitting message"
        );

        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        self.sending.insert(attempt, unit.clone());

        let (handle, outcome_rx) = DeliveryHandle::new(message.id.clone());
        let transmitted = AssertUnwindSafe(stub.transmit(message, handle.clone()))
            .catch_unwind()
            .await;
        match transmitted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                handle.fail(e);
            }
            Err(_) => {
                error!(
                    message_id = %unit.message().id,
                    recipient = %unit.recipient(),
                    address = %address,
                    "Messaging stub panicked during transmit"
                );
                handle.fail(TransportError::NotSent("transmit panicked".to_string()));
            }
        }

        // already finished by shutdown
        if self.sending.remove(&attempt).is_none() {
            return;
        }

        let router = self.clone();
        tokio::spawn(async move {
            let outcome = outcome_rx.await.unwrap_or_else(|_| {
                AttemptOutcome::Failed(TransportError::Unavailable(
                    "delivery handle dropped without an outcome".to_string(),
                ))
            });

            match outcome {
                AttemptOutcome::Delivered => router.finish_unit(&unit, UnitOutcome::Delivered),
                AttemptOutcome::Failed(error) => router.handle_failure(unit, error).await,
            }
        });
    }

    async fn handle_failure(&self, mut unit: DelayableMessage, error: TransportError) {
        if !error.is_retryable() {
            warn!(message_id = %unit.message().id, recipient = %unit.recipient(), error = %error, "Transport failed permanently");
            self.finish_unit(&unit, UnitOutcome::Dropped("not_sent"));
            return;
        }
        if unit.message().is_expired() {
            self.finish_unit(&unit, UnitOutcome::Dropped("expired"));
            return;
        }
        if let Some(max_retries) = self.settings.max_retry_count {
            if unit.retry_count() >= max_retries {
                self.finish_unit(&unit, UnitOutcome::Dropped("retries_exhausted"));
                return;
            }
        }

        let delay_ms = next_retry_delay_ms(
            unit.last_delay_ms(),
            error.suggested_delay_ms(),
            self.settings.send_msg_retry_interval_ms,
            self.settings.max_delay_with_exponential_backoff_ms,
        );
        unit.schedule_retry(delay_ms);
        router_metrics::record_retry();

        debug!(
            message_id = %unit.message().id,
            recipient = %unit.recipient(),
            retry_count = unit.retry_count(),
            delay_ms,
            error = %error,
            "Scheduling retry"
        );

        if let Err(e) = self.queue.put(unit.clone()).await {
            debug!(message_id = %unit.message().id, error = %e, "Could not requeue message");
            self.finish_unit(&unit, UnitOutcome::Dropped("shutdown"));
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    fn finish_unit(&self, unit: &DelayableMessage, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Delivered => {
                debug!(message_id = %unit.message().id, recipient = %unit.recipient(), "Message delivered");
                router_metrics::record_delivered();
            }
            UnitOutcome::Dropped(reason) => {
                warn!(
                    message_id = %unit.message().id,
                    recipient = %unit.recipient(),
                    retry_count = unit.retry_count(),
                    reason,
                    "Dropping message"
                );
                router_metrics::record_dropped(reason);
            }
        }

        let tracker = match self.trackers.get(unit.tracking_id()).map(|t| t.value().clone()) {
            Some(tracker) => tracker,
            None => {
                error!(message_id = %unit.message().id, tracking_id = %unit.tracking_id(), "Finished unit has no tracker");
                return;
            }
        };

        if tracker.pending_units.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.trackers.remove(unit.tracking_id());
            if let Some(participant_id) = &tracker.ref_holder {
                self.routing_table.decrement_reference_count(participant_id);
            }
            self.message_finished(&tracker.message_id);
        }
    }

    /// Ends an accepted message that never produced queued units.
    fn drop_message(&self, message: &ImmutableMessage, reason: &'static str) {
        warn!(message_id = %message.id, recipient = %message.recipient, reason, "Dropping message");
        router_metrics::record_dropped(reason);
        self.message_finished(&message.id);
    }

    fn message_finished(&self, message_id: &str) {
        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        router_metrics::set_in_flight(in_flight);
        self.listeners.notify(message_id);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    async fn drain_for_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(in_flight = self.in_flight_count(), "Message router preparing for shutdown");

        self.queue.close_intake();
        let discarded = self
            .queue
            .wait_for_queue_to_drain(self.settings.shutdown_drain_timeout())
            .await;
        for unit in &discarded {
            self.finish_unit(unit, UnitOutcome::Dropped("unroutable"));
        }
    }

    async fn stop(&self) {
        let remaining = self.queue.shutdown();
        if !remaining.is_empty() {
            warn!(remaining = remaining.len(), "Dropping messages still queued at shutdown");
        }
        for unit in &remaining {
            self.finish_unit(unit, UnitOutcome::Dropped("shutdown"));
        }

        self.pool.shutdown(self.settings.shutdown_drain_timeout()).await;

        // units whose transmit was cut off with an aborted worker
        let interrupted: Vec<u64> = self.sending.iter().map(|entry| *entry.key()).collect();
        for attempt in interrupted {
            if let Some((_, unit)) = self.sending.remove(&attempt) {
                self.finish_unit(&unit, UnitOutcome::Dropped("shutdown"));
            }
        }

        let lifecycle = self.lifecycle.lock().take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.shutdown();
        }

        info!("Message router shutdown complete");
    }
}

#[async_trait]
impl ShutdownListener for MessageRouter {
    async fn prepare_for_shutdown(&self) {
        self.drain_for_shutdown().await;
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}
