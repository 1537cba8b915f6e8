//! Participant routing table
//!
//! Maps participant ids to transport addresses. Entries carry a reference
//! count held by in-flight messages; an entry with references outlives both
//! explicit removal and expiry until the last reference is released.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rp_common::{now_ms, Address};
use tracing::{debug, info, warn};

use crate::validator::AddressValidator;

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingEntry {
    pub address: Address,
    pub is_globally_visible: bool,
    /// Epoch milliseconds after which the entry may be purged.
    pub expiry_date_ms: i64,
    /// Sticky entries are never purged.
    pub is_sticky: bool,
    pub ref_count: u64,
    /// Set when removal was requested while references were outstanding.
    pub pending_removal: bool,
}

impl RoutingEntry {
    pub fn new(address: Address, is_globally_visible: bool, expiry_date_ms: i64, is_sticky: bool) -> Self {
        Self {
            address,
            is_globally_visible,
            expiry_date_ms,
            is_sticky,
            ref_count: 0,
            pending_removal: false,
        }
    }
}

/// Thread-safe participant to address map.
pub trait RoutingTable: Send + Sync {
    fn get(&self, participant_id: &str) -> Option<Address>;

    /// Snapshot of the full entry.
    fn get_entry(&self, participant_id: &str) -> Option<RoutingEntry>;

    fn contains_key(&self, participant_id: &str) -> bool;

    fn is_globally_visible(&self, participant_id: &str) -> Option<bool>;

    /// Adds or merges a binding. Returns false when the address is not
    /// admissible or a conflicting binding may not be replaced.
    fn put(
        &self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
        expiry_date_ms: i64,
        is_sticky: bool,
    ) -> bool;

    /// Sets visibility unconditionally, including downgrades.
    fn set_globally_visible(&self, participant_id: &str, is_globally_visible: bool) -> bool;

    /// Extends the expiry date. Never shortens it.
    fn update_expiry_date(&self, participant_id: &str, expiry_date_ms: i64) -> bool;

    /// Removes the entry, or marks it for removal once its references are
    /// released. Returns true only if the entry is gone right away.
    fn remove(&self, participant_id: &str) -> bool;

    fn increment_reference_count(&self, participant_id: &str) -> bool;

    fn decrement_reference_count(&self, participant_id: &str) -> bool;

    /// Records that a participant exists without giving it an address.
    fn set_to_known(&self, participant_id: &str);

    fn is_known(&self, participant_id: &str) -> bool;

    /// Drops expired, unreferenced, non-sticky entries. Returns the ids removed.
    fn purge(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RoutingTableImpl {
    entries: DashMap<String, RoutingEntry>,
    known: DashSet<String>,
    validator: Arc<dyn AddressValidator>,
    grace_period_ms: i64,
}

impl RoutingTableImpl {
    pub fn new(validator: Arc<dyn AddressValidator>, grace_period_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            known: DashSet::new(),
            validator,
            grace_period_ms: i64::try_from(grace_period_ms).unwrap_or(i64::MAX),
        }
    }
}

impl RoutingTable for RoutingTableImpl {
    fn get(&self, participant_id: &str) -> Option<Address> {
        self.entries.get(participant_id).map(|e| e.address.clone())
    }

    fn get_entry(&self, participant_id: &str) -> Option<RoutingEntry> {
        self.entries.get(participant_id).map(|e| e.clone())
    }

    fn contains_key(&self, participant_id: &str) -> bool {
        self.entries.contains_key(participant_id)
    }

    fn is_globally_visible(&self, participant_id: &str) -> Option<bool> {
        self.entries.get(participant_id).map(|e| e.is_globally_visible)
    }

    fn put(
        &self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
        expiry_date_ms: i64,
        is_sticky: bool,
    ) -> bool {
        if !self.validator.is_valid_for_routing_table(&address) {
            warn!(participant_id = %participant_id, address = %address, "Address not admissible for routing table");
            return false;
        }

        let candidate = RoutingEntry::new(address, is_globally_visible, expiry_date_ms, is_sticky);

        match self.entries.entry(participant_id.to_string()) {
            Entry::Vacant(vacant) => {
                debug!(
                    participant_id = %participant_id,
                    address = %candidate.address,
                    globally_visible = is_globally_visible,
                    "Added routing entry"
                );
                vacant.insert(candidate);
                // a routed participant no longer needs the known marker
                self.known.remove(participant_id);
                true
            }
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if existing.address != candidate.address {
                    if !self.validator.allow_update(existing, &candidate) {
                        warn!(
                            participant_id = %participant_id,
                            existing = %existing.address,
                            rejected = %candidate.address,
                            "Routing entry update rejected"
                        );
                        return false;
                    }
                    info!(
                        participant_id = %participant_id,
                        old = %existing.address,
                        new = %candidate.address,
                        "Routing entry address replaced"
                    );
                    existing.address = candidate.address;
                }
                existing.is_globally_visible |= candidate.is_globally_visible;
                existing.expiry_date_ms = existing.expiry_date_ms.max(candidate.expiry_date_ms);
                existing.is_sticky |= candidate.is_sticky;
                existing.pending_removal = false;
                true
            }
        }
    }

    fn set_globally_visible(&self, participant_id: &str, is_globally_visible: bool) -> bool {
        match self.entries.get_mut(participant_id) {
            Some(mut entry) => {
                entry.is_globally_visible = is_globally_visible;
                true
            }
            None => false,
        }
    }

    fn update_expiry_date(&self, participant_id: &str, expiry_date_ms: i64) -> bool {
        match self.entries.get_mut(participant_id) {
            Some(mut entry) => {
                entry.expiry_date_ms = entry.expiry_date_ms.max(expiry_date_ms);
                true
            }
            None => false,
        }
    }

    fn remove(&self, participant_id: &str) -> bool {
        match self.entries.entry(participant_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().ref_count == 0 {
                    occupied.remove();
                    self.known.remove(participant_id);
                    debug!(participant_id = %participant_id, "Removed routing entry");
                    true
                } else {
                    let entry = occupied.get_mut();
                    entry.pending_removal = true;
                    debug!(
                        participant_id = %participant_id,
                        ref_count = entry.ref_count,
                        "Routing entry removal deferred until references are released"
                    );
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    fn increment_reference_count(&self, participant_id: &str) -> bool {
        match self.entries.get_mut(participant_id) {
            Some(mut entry) => {
                entry.ref_count += 1;
                true
            }
            None => false,
        }
    }

    fn decrement_reference_count(&self, participant_id: &str) -> bool {
        match self.entries.entry(participant_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.ref_count == 0 {
                    warn!(participant_id = %participant_id, "Reference count already zero");
                    return false;
                }
                entry.ref_count -= 1;
                if entry.ref_count == 0 && entry.pending_removal {
                    occupied.remove();
                    self.known.remove(participant_id);
                    debug!(participant_id = %participant_id, "Removed routing entry after last reference");
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    fn set_to_known(&self, participant_id: &str) {
        self.known.insert(participant_id.to_string());
    }

    fn is_known(&self, participant_id: &str) -> bool {
        self.known.contains(participant_id) || self.entries.contains_key(participant_id)
    }

    fn purge(&self) -> Vec<String> {
        let now = now_ms();
        let grace = self.grace_period_ms;
        let mut purged = Vec::new();

        self.entries.retain(|participant_id, entry| {
            let expired = !entry.is_sticky
                && entry.ref_count == 0
                && now > entry.expiry_date_ms.saturating_add(grace);
            if expired {
                purged.push(participant_id.clone());
            }
            !expired
        });

        for participant_id in &purged {
            self.known.remove(participant_id);
        }

        if !purged.is_empty() {
            info!(count = purged.len(), "Purged expired routing entries");
        }
        purged
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
