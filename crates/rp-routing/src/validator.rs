use std::collections::HashSet;

use rp_common::Address;

use crate::routing_table::RoutingEntry;

/// Decides which addresses may enter the routing table and which existing
/// bindings may be replaced.
pub trait AddressValidator: Send + Sync {
    fn is_valid_for_routing_table(&self, address: &Address) -> bool;

    /// Called when `candidate` would replace the address of `existing`.
    fn allow_update(&self, existing: &RoutingEntry, candidate: &RoutingEntry) -> bool;
}

/// Rejects malformed addresses and this node's own global addresses, and
/// never lets a less trusted transport replace a more trusted one.
#[derive(Debug, Default, Clone)]
pub struct DefaultAddressValidator {
    own_addresses: HashSet<Address>,
}

impl DefaultAddressValidator {
    pub fn new(own_addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            own_addresses: own_addresses.into_iter().collect(),
        }
    }

    fn precedence(address: &Address) -> u8 {
        match address {
            Address::InProcess { .. } => 3,
            Address::WebSocketClient { .. } | Address::UdsClient { .. } | Address::Binder { .. } => 2,
            Address::Mqtt { .. } | Address::WebSocket { .. } => 1,
        }
    }
}

impl AddressValidator for DefaultAddressValidator {
    fn is_valid_for_routing_table(&self, address: &Address) -> bool {
        address.is_valid() && !self.own_addresses.contains(address)
    }

    fn allow_update(&self, existing: &RoutingEntry, candidate: &RoutingEntry) -> bool {
        Self::precedence(&candidate.address) >= Self::precedence(&existing.address)
    }
}
