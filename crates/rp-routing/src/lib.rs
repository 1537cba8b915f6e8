//! Relaypoint routing state
//!
//! This crate provides:
//! - RoutingTable: participant id to transport address bindings with reference counting
//! - AddressValidator: admission and precedence rules for routing-table updates
//! - MulticastReceiverRegistry: multicast id (with wildcards) to receiving participants
//! - AddressManager: recipient and address resolution for outgoing messages

pub mod routing_table;
pub mod validator;
pub mod multicast;
pub mod address_manager;

pub use routing_table::{RoutingTable, RoutingTableImpl, RoutingEntry};
pub use validator::{AddressValidator, DefaultAddressValidator};
pub use multicast::{MulticastReceiverRegistry, InMemoryMulticastReceiverRegistry};
pub use address_manager::{
    AddressManager, MulticastAddressCalculator, MqttMulticastAddressCalculator,
    MULTICAST_ADDRESS_CALCULATOR_PARTICIPANT_ID,
};
