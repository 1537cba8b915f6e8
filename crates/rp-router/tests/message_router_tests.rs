//! Message Router Tests
//!
//! Tests for:
//! - Validation and synchronous rejection
//! - Unicast delivery, retries, backoff and retry limits
//! - Multicast fan-out with per-recipient failure isolation
//! - Route reference counting
//! - Access control
//! - Persisted restore and shutdown

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rp_common::{now_ms, Address, AddressKind, DelayableMessage, ImmutableMessage, MessageType, TransportError};
use rp_config::RouterSettings;
use rp_queue::{InMemoryMessagePersister, MessagePersister, MessageQueue, NoOpMessagePersister};
use rp_routing::{
    AddressManager, DefaultAddressValidator, InMemoryMulticastReceiverRegistry, MqttMulticastAddressCalculator,
    MulticastAddressCalculator, RoutingTable, RoutingTableImpl,
};
use rp_router::{
    AccessController, DeliveryHandle, MessageProcessedListener, MessageRouter, MessagingStub,
    MessagingStubFactory, MessagingStubRegistry, RouterComponents, RouterError, ShutdownNotifier,
};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Clone, Debug)]
enum Step {
    Succeed,
    Fail(TransportError),
    /// Report failure from another task after a short pause
    FailLater(TransportError),
    /// Report success, then also return an error
    SucceedThenError,
    /// Drop the handle without any outcome
    DropHandle,
    /// Panic inside transmit
    Panic,
    /// Stay inside transmit for a while, then succeed
    Hang(Duration),
}

/// Per-target scripted transport behaviour; unscripted calls succeed.
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    fallbacks: Mutex<HashMap<String, Step>>,
    calls: Mutex<HashMap<String, Vec<Instant>>>,
}

impl ScriptedTransport {
    fn script(&self, target: &str, steps: Vec<Step>) {
        self.scripts.lock().insert(target.to_string(), steps.into());
    }

    fn always(&self, target: &str, step: Step) {
        self.fallbacks.lock().insert(target.to_string(), step);
    }

    fn calls(&self, target: &str) -> Vec<Instant> {
        self.calls.lock().get(target).cloned().unwrap_or_default()
    }

    fn call_count(&self, target: &str) -> usize {
        self.calls.lock().get(target).map_or(0, |c| c.len())
    }

    fn next_step(&self, target: &str) -> Step {
        self.calls.lock().entry(target.to_string()).or_default().push(Instant::now());
        if let Some(step) = self.scripts.lock().get_mut(target).and_then(|s| s.pop_front()) {
            return step;
        }
        self.fallbacks.lock().get(target).cloned().unwrap_or(Step::Succeed)
    }
}

struct ScriptedStub {
    target: String,
    transport: Arc<ScriptedTransport>,
}

#[async_trait]
impl MessagingStub for ScriptedStub {
    async fn transmit(
        &self,
        _message: Arc<ImmutableMessage>,
        handle: DeliveryHandle,
    ) -> Result<(), TransportError> {
        match self.transport.next_step(&self.target) {
            Step::Succeed => {
                handle.succeed();
                Ok(())
            }
            Step::Fail(error) => Err(error),
            Step::FailLater(error) => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    handle.fail(error);
                });
                Ok(())
            }
            Step::SucceedThenError => {
                handle.succeed();
                Err(TransportError::Unavailable("late error".to_string()))
            }
            Step::DropHandle => {
                drop(handle);
                Ok(())
            }
            Step::Panic => panic!("transport bug"),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                handle.succeed();
                Ok(())
            }
        }
    }
}

struct ScriptedFactory(Arc<ScriptedTransport>);

impl MessagingStubFactory for ScriptedFactory {
    fn create(&self, address: &Address) -> Option<Arc<dyn MessagingStub>> {
        let target = match address {
            Address::InProcess { id } => id.clone(),
            Address::Mqtt { topic, .. } => topic.clone(),
            _ => return None,
        };
        Some(Arc::new(ScriptedStub {
            target,
            transport: self.0.clone(),
        }))
    }
}

struct ChannelListener(mpsc::UnboundedSender<String>);

impl MessageProcessedListener for ChannelListener {
    fn message_processed(&self, message_id: &str) {
        let _ = self.0.send(message_id.to_string());
    }
}

struct StaticAccess(bool);

#[async_trait]
impl AccessController for StaticAccess {
    async fn has_consumer_permission(&self, _message: &ImmutableMessage) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

struct FailingAccess;

#[async_trait]
impl AccessController for FailingAccess {
    async fn has_consumer_permission(&self, _message: &ImmutableMessage) -> anyhow::Result<bool> {
        Err(anyhow::anyhow!("policy store unavailable"))
    }
}

struct PanickingAccess;

#[async_trait]
impl AccessController for PanickingAccess {
    async fn has_consumer_permission(&self, _message: &ImmutableMessage) -> anyhow::Result<bool> {
        panic!("policy evaluation bug");
    }
}

struct SlowAccess(Duration);

#[async_trait]
impl AccessController for SlowAccess {
    async fn has_consumer_permission(&self, _message: &ImmutableMessage) -> anyhow::Result<bool> {
        tokio::time::sleep(self.0).await;
        Ok(true)
    }
}

// ============================================================================
// Harness
// ============================================================================

fn test_settings() -> RouterSettings {
    RouterSettings {
        max_parallel_sends: 4,
        send_msg_retry_interval_ms: 10,
        max_delay_with_exponential_backoff_ms: Some(100),
        routing_table_grace_period_ms: 0,
        shutdown_drain_timeout_ms: 200,
        ..RouterSettings::default()
    }
}

#[derive(Default)]
struct Options {
    access_controller: Option<Arc<dyn AccessController>>,
    persister: Option<Arc<dyn MessagePersister>>,
    calculators: Vec<Arc<dyn MulticastAddressCalculator>>,
}

struct Harness {
    router: Arc<MessageRouter>,
    table: Arc<dyn RoutingTable>,
    transport: Arc<ScriptedTransport>,
    processed: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    async fn start(settings: RouterSettings) -> Self {
        Self::start_with(settings, Options::default()).await
    }

    async fn start_with(settings: RouterSettings, options: Options) -> Self {
        let table: Arc<dyn RoutingTable> = Arc::new(RoutingTableImpl::new(
            Arc::new(DefaultAddressValidator::default()),
            settings.routing_table_grace_period_ms,
        ));
        let address_manager = Arc::new(AddressManager::new(
            table.clone(),
            options.calculators,
            Arc::new(InMemoryMulticastReceiverRegistry::new()),
        ));
        let persister = options.persister.unwrap_or_else(|| Arc::new(NoOpMessagePersister));
        let queue = Arc::new(MessageQueue::new(settings.message_queue_id.clone(), persister, table.clone()));

        let transport = Arc::new(ScriptedTransport::default());
        let factory: Arc<dyn MessagingStubFactory> = Arc::new(ScriptedFactory(transport.clone()));
        let stub_registry = MessagingStubRegistry::new()
            .with_factory(AddressKind::InProcess, factory.clone())
            .with_factory(AddressKind::Mqtt, factory);

        let router = MessageRouter::new(
            settings,
            RouterComponents {
                routing_table: table.clone(),
                address_manager,
                message_queue: queue,
                stub_registry,
                access_controller: options.access_controller,
            },
        )
        .unwrap();

        let (tx, processed) = mpsc::unbounded_channel();
        router.register_message_processed_listener(Arc::new(ChannelListener(tx)));
        router.start().await;

        Self {
            router,
            table,
            transport,
            processed,
        }
    }

    fn add_participant(&self, participant_id: &str) {
        assert!(self.table.put(
            participant_id,
            Address::in_process(participant_id),
            false,
            now_ms() + 600_000,
            false,
        ));
    }

    fn ref_count(&self, participant_id: &str) -> u64 {
        self.table.get_entry(participant_id).map_or(0, |e| e.ref_count)
    }

    async fn next_processed(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.processed.recv())
            .await
            .expect("no message-processed notification")
            .expect("listener channel closed")
    }

    async fn assert_no_more_notifications(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(150), self.processed.recv()).await;
        assert!(extra.is_err(), "unexpected notification: {:?}", extra);
    }
}

fn request(sender: &str, recipient: &str) -> ImmutableMessage {
    ImmutableMessage::new(MessageType::Request, sender, recipient, 60_000)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_message_is_rejected() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("proxy");
    h.add_participant("provider");

    let msg = request("proxy", "provider").with_absolute_ttl(now_ms() - 1);
    let id = msg.id.clone();

    let err = h.router.route(msg).await.unwrap_err();
    assert!(matches!(err, RouterError::MessageExpired { .. }));
    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;

    assert_eq!(h.transport.call_count("provider"), 0);
    assert_eq!(h.ref_count("proxy"), 0);
    assert_eq!(h.router.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relative_ttl_is_rejected() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("provider");

    let msg = request("proxy", "provider").with_relative_ttl(60_000);
    let id = msg.id.clone();

    let err = h.router.route(msg).await.unwrap_err();
    assert!(matches!(err, RouterError::RelativeTtl { .. }));
    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.transport.call_count("provider"), 0);
}

// ============================================================================
// Unicast
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unicast_is_delivered_once() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("proxy");
    h.add_participant("provider");

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert_eq!(h.transport.call_count("provider"), 1);
    assert_eq!(h.ref_count("proxy"), 0);
    assert_eq!(h.router.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_retry_count_bounds_attempts() {
    let settings = RouterSettings {
        max_retry_count: Some(3),
        ..test_settings()
    };
    let mut h = Harness::start(settings).await;
    h.add_participant("provider");
    h.transport.always("provider", Step::Fail(TransportError::Unavailable("down".into())));

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert_eq!(h.transport.call_count("provider"), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_gaps_grow_then_cap() {
    let settings = RouterSettings {
        send_msg_retry_interval_ms: 10,
        max_delay_with_exponential_backoff_ms: Some(40),
        ..test_settings()
    };
    let h = Harness::start(settings).await;
    h.add_participant("provider");
    h.transport.always("provider", Step::Fail(TransportError::delay(1, "busy")));

    h.router.route(request("proxy", "provider")).await.unwrap();
    wait_until(|| h.transport.call_count("provider") >= 7).await;

    let calls = h.transport.calls("provider");
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    for gap in &gaps {
        assert!(*gap <= Duration::from_millis(140), "gap {:?} exceeds cap", gap);
    }
    for gap in &gaps[2..6] {
        assert!(*gap >= Duration::from_millis(35), "gap {:?} below cap", gap);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_messages_do_not_starve_others() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("failing");
    h.add_participant("healthy");
    h.transport.always("failing", Step::Fail(TransportError::delay(20, "busy")));

    for _ in 0..10 {
        h.router.route(request("proxy", "failing")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let msg = request("proxy", "healthy");
    let id = msg.id.clone();
    let start = Instant::now();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_completion_wins() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("provider");
    h.transport.script("provider", vec![Step::SucceedThenError]);

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert_eq!(h.transport.call_count("provider"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_asynchronous_failure_is_retried() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("provider");
    h.transport.script(
        "provider",
        vec![Step::FailLater(TransportError::Unavailable("reconnecting".into())), Step::DropHandle],
    );

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.transport.call_count("provider"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fatal_failure_drops_without_retry() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("provider");
    h.transport.always("provider", Step::Fail(TransportError::NotSent("rejected".into())));

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert_eq!(h.transport.call_count("provider"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_stub_drops_message_and_keeps_workers() {
    let settings = RouterSettings {
        max_parallel_sends: 2,
        ..test_settings()
    };
    let mut h = Harness::start(settings).await;
    h.add_participant("proxy");
    h.add_participant("provider");
    h.add_participant("healthy");
    h.transport.always("provider", Step::Panic);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let msg = request("proxy", "provider");
        ids.push(msg.id.clone());
        h.router.route(msg).await.unwrap();
    }

    let mut processed = Vec::new();
    for _ in 0..3 {
        processed.push(h.next_processed().await);
    }
    processed.sort();
    ids.sort();
    assert_eq!(processed, ids);
    assert_eq!(h.transport.call_count("provider"), 3);
    assert_eq!(h.ref_count("proxy"), 0);
    assert_eq!(h.router.in_flight_count(), 0);

    // workers are still alive
    let msg = request("proxy", "healthy");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();
    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.transport.call_count("healthy"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_waits_for_route() {
    let mut h = Harness::start(test_settings()).await;

    let msg = request("proxy", "late-provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.call_count("late-provider"), 0);
    h.add_participant("late-provider");

    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.transport.call_count("late-provider"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unroutable_reply_is_dropped() {
    let mut h = Harness::start(test_settings()).await;

    for message_type in [MessageType::Reply, MessageType::Publication, MessageType::SubscriptionReply] {
        let msg = ImmutableMessage::new(message_type, "provider", "gone-proxy", 60_000);
        let id = msg.id.clone();
        h.router.route(msg).await.unwrap();
        assert_eq!(h.next_processed().await, id);
    }
    assert_eq!(h.transport.call_count("gone-proxy"), 0);
    assert_eq!(h.router.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_expiring_while_retrying_is_dropped() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("provider");
    h.transport.always("provider", Step::Fail(TransportError::Unavailable("down".into())));

    let msg = ImmutableMessage::new(MessageType::Request, "proxy", "provider", 80);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert!(h.transport.call_count("provider") >= 1);
}

// ============================================================================
// Multicast
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multicast_recipients_fail_independently() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("a");
    h.add_participant("b");
    let registry = h.router.address_manager().multicast_registry().clone();
    registry.register_receiver("provider/tick", "a");
    registry.register_receiver("provider/tick", "b");

    h.transport.script(
        "b",
        vec![
            Step::Fail(TransportError::delay(1, "busy")),
            Step::Fail(TransportError::delay(1, "busy")),
            Step::Fail(TransportError::NotSent("gone".into())),
        ],
    );

    let msg = ImmutableMessage::new(MessageType::Multicast, "provider", "provider/tick", 60_000);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert_eq!(h.transport.call_count("a"), 1);
    assert_eq!(h.transport.call_count("b"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multicast_wildcard_and_calculator() {
    let options = Options {
        calculators: vec![Arc::new(MqttMulticastAddressCalculator::new("tcp://broker:1883", "mc/"))],
        ..Options::default()
    };
    let mut h = Harness::start_with(test_settings(), options).await;
    h.add_participant("local-proxy");
    h.router
        .address_manager()
        .multicast_registry()
        .register_receiver("provider/+", "local-proxy");

    let msg = ImmutableMessage::new(MessageType::Multicast, "provider", "provider/tick", 60_000);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.transport.call_count("local-proxy"), 1);
    assert_eq!(h.transport.call_count("mc/provider/tick"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multicast_without_recipients_is_dropped() {
    let mut h = Harness::start(test_settings()).await;

    let msg = ImmutableMessage::new(MessageType::Multicast, "provider", "provider/tick", 60_000);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.router.in_flight_count(), 0);
}

// ============================================================================
// Reference counting
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_holds_sender_route_until_done() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("proxy");
    h.add_participant("provider");
    h.transport.script(
        "provider",
        vec![
            Step::Fail(TransportError::delay(50, "busy")),
            Step::Fail(TransportError::delay(50, "busy")),
        ],
    );

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    wait_until(|| h.transport.call_count("provider") >= 1).await;
    assert_eq!(h.ref_count("proxy"), 1);

    // removal is deferred while the message is in flight
    assert!(!h.table.remove("proxy"));
    assert!(h.table.contains_key("proxy"));

    assert_eq!(h.next_processed().await, id);
    assert!(!h.table.contains_key("proxy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_referenced_route_survives_purge() {
    let mut h = Harness::start(test_settings()).await;
    h.table.put("proxy", Address::in_process("proxy"), false, now_ms() - 1000, false);
    h.add_participant("provider");
    h.transport.always("provider", Step::Fail(TransportError::delay(50, "busy")));

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();
    wait_until(|| h.transport.call_count("provider") >= 1).await;

    assert!(h.table.purge().is_empty());
    assert!(h.table.contains_key("proxy"));

    // once the message is done the expired route is swept
    h.transport.always("provider", Step::Succeed);
    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.ref_count("proxy"), 0);
    assert_eq!(h.table.purge(), vec!["proxy".to_string()]);
    assert!(!h.table.contains_key("proxy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_holds_recipient_route() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("provider");
    h.add_participant("proxy");
    h.transport.script("proxy", vec![Step::Fail(TransportError::delay(50, "busy"))]);

    let msg = ImmutableMessage::new(MessageType::Reply, "provider", "proxy", 60_000);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    wait_until(|| h.transport.call_count("proxy") >= 1).await;
    assert_eq!(h.ref_count("proxy"), 1);
    assert_eq!(h.ref_count("provider"), 0);

    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.ref_count("proxy"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscription_reply_from_in_process_provider_is_not_counted() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("provider");
    h.add_participant("proxy");
    h.transport.script("proxy", vec![Step::Fail(TransportError::delay(50, "busy"))]);

    let msg = ImmutableMessage::new(MessageType::SubscriptionReply, "provider", "proxy", 60_000);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    wait_until(|| h.transport.call_count("proxy") >= 1).await;
    assert_eq!(h.ref_count("proxy"), 0);
    assert_eq!(h.next_processed().await, id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscription_reply_from_remote_provider_is_counted() {
    let mut h = Harness::start(test_settings()).await;
    h.table.put(
        "provider",
        Address::mqtt("tcp://broker:1883", "provider/topic"),
        true,
        now_ms() + 600_000,
        false,
    );
    h.add_participant("proxy");
    h.transport.script("proxy", vec![Step::Fail(TransportError::delay(50, "busy"))]);

    let msg = ImmutableMessage::new(MessageType::SubscriptionReply, "provider", "proxy", 60_000);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    wait_until(|| h.transport.call_count("proxy") >= 1).await;
    assert_eq!(h.ref_count("proxy"), 1);
    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.ref_count("proxy"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_set_to_known_creates_no_route() {
    let h = Harness::start(test_settings()).await;
    h.router.set_to_known("someone");

    assert!(h.table.is_known("someone"));
    assert!(!h.table.contains_key("someone"));
}

// ============================================================================
// Access control
// ============================================================================

fn with_access(controller: Arc<dyn AccessController>) -> (RouterSettings, Options) {
    let settings = RouterSettings {
        access_control_enabled: true,
        ..test_settings()
    };
    let options = Options {
        access_controller: Some(controller),
        ..Options::default()
    };
    (settings, options)
}

#[tokio::test]
async fn test_access_control_requires_controller() {
    let settings = RouterSettings {
        access_control_enabled: true,
        ..test_settings()
    };
    let table: Arc<dyn RoutingTable> =
        Arc::new(RoutingTableImpl::new(Arc::new(DefaultAddressValidator::default()), 0));
    let result = MessageRouter::new(
        settings,
        RouterComponents {
            routing_table: table.clone(),
            address_manager: Arc::new(AddressManager::new(
                table.clone(),
                Vec::new(),
                Arc::new(InMemoryMulticastReceiverRegistry::new()),
            )),
            message_queue: Arc::new(MessageQueue::new("q", Arc::new(NoOpMessagePersister), table)),
            stub_registry: MessagingStubRegistry::new(),
            access_controller: None,
        },
    );
    assert!(matches!(result, Err(RouterError::MissingAccessController)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_permitted_message_is_delivered() {
    let (settings, options) = with_access(Arc::new(StaticAccess(true)));
    let mut h = Harness::start_with(settings, options).await;
    h.add_participant("provider");

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.transport.call_count("provider"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_denied_and_failed_checks_drop_once() {
    let controllers: Vec<Arc<dyn AccessController>> =
        vec![Arc::new(StaticAccess(false)), Arc::new(FailingAccess), Arc::new(PanickingAccess)];

    for controller in controllers {
        let (settings, options) = with_access(controller);
        let mut h = Harness::start_with(settings, options).await;
        h.add_participant("provider");

        let msg = request("proxy", "provider");
        let id = msg.id.clone();
        h.router.route(msg).await.unwrap();

        assert_eq!(h.next_processed().await, id);
        h.assert_no_more_notifications().await;
        assert_eq!(h.transport.call_count("provider"), 0);
        assert_eq!(h.router.in_flight_count(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_expiring_during_access_check_is_dropped() {
    let (settings, options) = with_access(Arc::new(SlowAccess(Duration::from_millis(100))));
    let mut h = Harness::start_with(settings, options).await;
    h.add_participant("provider");

    let msg = ImmutableMessage::new(MessageType::Request, "proxy", "provider", 30);
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert_eq!(h.transport.call_count("provider"), 0);
}

// ============================================================================
// Persistence and shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_persisted_messages_are_restored() {
    let settings = test_settings();
    let persister = Arc::new(InMemoryMessagePersister::new());
    let msg = Arc::new(request("proxy", "provider"));
    let unit = DelayableMessage::new(msg.clone(), "provider", "previous-run", 0);
    persister.persist(&settings.message_queue_id, &unit).await.unwrap();

    let options = Options {
        persister: Some(persister.clone()),
        ..Options::default()
    };
    let mut h = Harness::start_with(settings, options).await;
    h.add_participant("provider");

    assert_eq!(h.next_processed().await, msg.id);
    assert_eq!(h.transport.call_count("provider"), 1);
    assert!(persister.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drops_pending_and_rejects_new() {
    let settings = RouterSettings {
        max_delay_with_exponential_backoff_ms: None,
        ..test_settings()
    };
    let mut h = Harness::start(settings).await;
    h.add_participant("provider");
    h.transport.always("provider", Step::Fail(TransportError::delay(10_000, "busy")));

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();
    wait_until(|| h.transport.call_count("provider") >= 1).await;
    // let the retry land in the queue
    tokio::time::sleep(Duration::from_millis(30)).await;

    let notifier = ShutdownNotifier::new();
    notifier.register(h.router.clone());
    notifier.shutdown().await;

    assert_eq!(h.next_processed().await, id);
    assert_eq!(h.router.in_flight_count(), 0);

    let late = request("proxy", "provider");
    let late_id = late.id.clone();
    let err = h.router.route(late).await.unwrap_err();
    assert!(matches!(err, RouterError::ShutdownInProgress));
    assert_eq!(h.next_processed().await, late_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_finishes_unit_stuck_in_transmit() {
    let mut h = Harness::start(test_settings()).await;
    h.add_participant("proxy");
    h.add_participant("provider");
    h.transport.always("provider", Step::Hang(Duration::from_secs(3)));

    let msg = request("proxy", "provider");
    let id = msg.id.clone();
    h.router.route(msg).await.unwrap();
    wait_until(|| h.transport.call_count("provider") >= 1).await;
    assert_eq!(h.ref_count("proxy"), 1);

    let start = Instant::now();
    h.router.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(h.next_processed().await, id);
    h.assert_no_more_notifications().await;
    assert_eq!(h.ref_count("proxy"), 0);
    assert_eq!(h.router.in_flight_count(), 0);
}
