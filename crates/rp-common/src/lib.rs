use serde::{Deserialize, Serialize};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Reply,
    OneWay,
    SubscriptionRequest,
    BroadcastSubscriptionRequest,
    MulticastSubscriptionRequest,
    SubscriptionReply,
    SubscriptionStop,
    Publication,
    Multicast,
}

/// Which side of a message keeps a routing-table entry alive while the
/// message is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteHolder {
    Sender,
    Recipient,
    None,
}

impl MessageType {
    /// Request-like messages keep the sender's route alive for the reply path.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::Request
                | MessageType::OneWay
                | MessageType::SubscriptionRequest
                | MessageType::BroadcastSubscriptionRequest
                | MessageType::MulticastSubscriptionRequest
        )
    }

    /// Reply-like messages travel back along a route held by the recipient.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageType::Reply | MessageType::SubscriptionReply | MessageType::Publication
        )
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, MessageType::Multicast)
    }

    pub fn route_holder(&self) -> RouteHolder {
        if self.is_request() {
            RouteHolder::Sender
        } else if self.is_reply() {
            RouteHolder::Recipient
        } else {
            RouteHolder::None
        }
    }

    /// Whether a missing address is worth waiting for. Replies, publications
    /// and multicasts answer someone who already had a route; if it is gone,
    /// it will not come back.
    pub fn retries_unresolved_address(&self) -> bool {
        !self.is_reply() && !self.is_multicast()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::Reply => "reply",
            MessageType::OneWay => "one_way",
            MessageType::SubscriptionRequest => "subscription_request",
            MessageType::BroadcastSubscriptionRequest => "broadcast_subscription_request",
            MessageType::MulticastSubscriptionRequest => "multicast_subscription_request",
            MessageType::SubscriptionReply => "subscription_reply",
            MessageType::SubscriptionStop => "subscription_stop",
            MessageType::Publication => "publication",
            MessageType::Multicast => "multicast",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Core Message
// ============================================================================

/// An already-serialized message with the header fields routing needs.
///
/// For multicast messages `recipient` carries the multicast id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImmutableMessage {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub message_type: MessageType,
    /// Expiry in epoch milliseconds when `ttl_absolute` is set, otherwise a
    /// relative duration in milliseconds.
    pub ttl_ms: i64,
    pub ttl_absolute: bool,
    pub payload: Vec<u8>,
}

impl ImmutableMessage {
    /// New message with a fresh id and an absolute TTL `relative_ttl_ms` from now.
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        relative_ttl_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            ttl_ms: now_ms().saturating_add(relative_ttl_ms),
            ttl_absolute: true,
            payload: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_relative_ttl(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self.ttl_absolute = false;
        self
    }

    pub fn with_absolute_ttl(mut self, expiry_ms: i64) -> Self {
        self.ttl_ms = expiry_ms;
        self.ttl_absolute = true;
        self
    }

    /// Only meaningful for absolute TTLs.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.ttl_absolute && now_ms > self.ttl_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }
}

// ============================================================================
// Addresses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSocketProtocol {
    Ws,
    Wss,
}

/// Transport-specific destination of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Address {
    Mqtt { broker_uri: String, topic: String },
    WebSocket { protocol: WebSocketProtocol, host: String, port: u16, path: String },
    WebSocketClient { id: String },
    UdsClient { id: String },
    Binder { package_name: String },
    /// Provider or proxy living in this process.
    InProcess { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressKind {
    Mqtt,
    WebSocket,
    WebSocketClient,
    UdsClient,
    Binder,
    InProcess,
}

impl Address {
    pub fn mqtt(broker_uri: impl Into<String>, topic: impl Into<String>) -> Self {
        Address::Mqtt { broker_uri: broker_uri.into(), topic: topic.into() }
    }

    pub fn in_process(id: impl Into<String>) -> Self {
        Address::InProcess { id: id.into() }
    }

    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Mqtt { .. } => AddressKind::Mqtt,
            Address::WebSocket { .. } => AddressKind::WebSocket,
            Address::WebSocketClient { .. } => AddressKind::WebSocketClient,
            Address::UdsClient { .. } => AddressKind::UdsClient,
            Address::Binder { .. } => AddressKind::Binder,
            Address::InProcess { .. } => AddressKind::InProcess,
        }
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self, Address::InProcess { .. })
    }

    /// Addresses reachable from outside this node.
    pub fn is_global(&self) -> bool {
        matches!(self, Address::Mqtt { .. } | Address::WebSocket { .. })
    }

    /// Structural validity: every identifying field must be present.
    pub fn is_valid(&self) -> bool {
        match self {
            Address::Mqtt { broker_uri, topic } => !broker_uri.is_empty() && !topic.is_empty(),
            Address::WebSocket { host, port, .. } => !host.is_empty() && *port != 0,
            Address::WebSocketClient { id } | Address::UdsClient { id } | Address::InProcess { id } => {
                !id.is_empty()
            }
            Address::Binder { package_name } => !package_name.is_empty(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Mqtt { broker_uri, topic } => write!(f, "mqtt({}, {})", broker_uri, topic),
            Address::WebSocket { protocol, host, port, path } => {
                let scheme = match protocol {
                    WebSocketProtocol::Ws => "ws",
                    WebSocketProtocol::Wss => "wss",
                };
                write!(f, "{}://{}:{}{}", scheme, host, port, path)
            }
            Address::WebSocketClient { id } => write!(f, "websocket-client({})", id),
            Address::UdsClient { id } => write!(f, "uds-client({})", id),
            Address::Binder { package_name } => write!(f, "binder({})", package_name),
            Address::InProcess { id } => write!(f, "in-process({})", id),
        }
    }
}

// ============================================================================
// Queued Units
// ============================================================================

/// One pending send of a message to one recipient.
#[derive(Debug, Clone)]
pub struct DelayableMessage {
    message: Arc<ImmutableMessage>,
    recipient: String,
    tracking_id: String,
    ready_at_ms: i64,
    retry_count: u32,
    last_delay_ms: u64,
}

impl DelayableMessage {
    pub fn new(
        message: Arc<ImmutableMessage>,
        recipient: impl Into<String>,
        tracking_id: impl Into<String>,
        delay_ms: u64,
    ) -> Self {
        Self {
            message,
            recipient: recipient.into(),
            tracking_id: tracking_id.into(),
            ready_at_ms: now_ms().saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX)),
            retry_count: 0,
            last_delay_ms: 0,
        }
    }

    pub fn message(&self) -> &Arc<ImmutableMessage> {
        &self.message
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn ready_at_ms(&self) -> i64 {
        self.ready_at_ms
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Delay used for the most recent retry, 0 before the first one.
    pub fn last_delay_ms(&self) -> u64 {
        self.last_delay_ms
    }

    /// Milliseconds until the unit may be taken; negative once ready.
    pub fn remaining_delay_ms(&self, now_ms: i64) -> i64 {
        self.ready_at_ms - now_ms
    }

    /// Reschedules the unit `delay_ms` from now and counts the retry.
    pub fn schedule_retry(&mut self, delay_ms: u64) {
        self.retry_count += 1;
        self.last_delay_ms = delay_ms;
        self.ready_at_ms = now_ms().saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX));
    }

    /// Stable key of this unit for persistence.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.tracking_id, self.message.id, self.recipient)
    }
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Failure reported by a transport stub for one transmit attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport asks for the attempt to be repeated after `delay_ms`.
    #[error("delivery delayed by {delay_ms} ms: {reason}")]
    Delay { delay_ms: u64, reason: String },

    /// Transient failure without a delay hint; retried with backoff.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The message cannot be sent through this transport. Never retried.
    #[error("message not sent: {0}")]
    NotSent(String),
}

impl TransportError {
    pub fn delay(delay_ms: u64, reason: impl Into<String>) -> Self {
        TransportError::Delay { delay_ms, reason: reason.into() }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::NotSent(_))
    }

    pub fn suggested_delay_ms(&self) -> Option<u64> {
        match self {
            TransportError::Delay { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        }
    }
}
