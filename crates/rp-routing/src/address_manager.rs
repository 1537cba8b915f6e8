//! Recipient and address resolution
//!
//! Unicast messages go to their named recipient. Multicast messages fan out
//! to every locally registered receiver plus, when calculators are
//! configured, one synthetic recipient whose address is derived from the
//! message itself (e.g. a broker topic).

use std::collections::HashSet;
use std::sync::Arc;

use rp_common::{Address, DelayableMessage, ImmutableMessage};
use tracing::debug;

use crate::multicast::MulticastReceiverRegistry;
use crate::routing_table::RoutingTable;

/// Placeholder recipient standing for "wherever the calculators say".
pub const MULTICAST_ADDRESS_CALCULATOR_PARTICIPANT_ID: &str = "relaypoint.multicast-address-calculator";

pub trait MulticastAddressCalculator: Send + Sync {
    /// Global address a multicast should be published to, if this
    /// calculator handles it.
    fn calculate(&self, message: &ImmutableMessage) -> Option<Address>;
}

/// Publishes multicasts on `<topic_prefix><multicast id>` at one broker.
pub struct MqttMulticastAddressCalculator {
    broker_uri: String,
    topic_prefix: String,
}

impl MqttMulticastAddressCalculator {
    pub fn new(broker_uri: impl Into<String>, topic_prefix: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            topic_prefix: topic_prefix.into(),
        }
    }
}

impl MulticastAddressCalculator for MqttMulticastAddressCalculator {
    fn calculate(&self, message: &ImmutableMessage) -> Option<Address> {
        if !message.message_type.is_multicast() {
            return None;
        }
        Some(Address::mqtt(
            self.broker_uri.clone(),
            format!("{}{}", self.topic_prefix, message.recipient),
        ))
    }
}

pub struct AddressManager {
    routing_table: Arc<dyn RoutingTable>,
    calculators: Vec<Arc<dyn MulticastAddressCalculator>>,
    multicast_registry: Arc<dyn MulticastReceiverRegistry>,
}

impl AddressManager {
    pub fn new(
        routing_table: Arc<dyn RoutingTable>,
        calculators: Vec<Arc<dyn MulticastAddressCalculator>>,
        multicast_registry: Arc<dyn MulticastReceiverRegistry>,
    ) -> Self {
        Self {
            routing_table,
            calculators,
            multicast_registry,
        }
    }

    /// Participants a message must be delivered to. May be empty.
    pub fn participant_ids_for_message(&self, message: &ImmutableMessage) -> HashSet<String> {
        if !message.message_type.is_multicast() {
            return HashSet::from([message.recipient.clone()]);
        }

        let mut ids = self.multicast_registry.get_receivers(&message.recipient);
        if !self.calculators.is_empty() {
            ids.insert(MULTICAST_ADDRESS_CALCULATOR_PARTICIPANT_ID.to_string());
        }
        debug!(
            message_id = %message.id,
            multicast_id = %message.recipient,
            recipients = ids.len(),
            "Resolved multicast recipients"
        );
        ids
    }

    /// Current address of a queued unit's recipient.
    pub fn address_for_message(&self, unit: &DelayableMessage) -> Option<Address> {
        if unit.recipient() == MULTICAST_ADDRESS_CALCULATOR_PARTICIPANT_ID {
            return self
                .calculators
                .iter()
                .find_map(|calculator| calculator.calculate(unit.message()));
        }
        self.routing_table.get(unit.recipient())
    }

    pub fn routing_table(&self) -> &Arc<dyn RoutingTable> {
        &self.routing_table
    }

    pub fn multicast_registry(&self) -> &Arc<dyn MulticastReceiverRegistry> {
        &self.multicast_registry
    }
}
