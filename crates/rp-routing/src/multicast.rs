//! Multicast receiver registry
//!
//! Multicast ids are `/`-separated. Registrations may use wildcards:
//! `+` matches exactly one segment, a trailing `*` matches any remainder.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, warn};

pub trait MulticastReceiverRegistry: Send + Sync {
    fn register_receiver(&self, multicast_id: &str, participant_id: &str);

    fn unregister_receiver(&self, multicast_id: &str, participant_id: &str);

    /// All participants whose registrations match `multicast_id`.
    fn get_receivers(&self, multicast_id: &str) -> HashSet<String>;
}

struct Registration {
    /// None for plain ids, which only match themselves.
    pattern: Option<Regex>,
    receivers: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryMulticastReceiverRegistry {
    registrations: RwLock<HashMap<String, Registration>>,
}

impl InMemoryMulticastReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_wildcard(multicast_id: &str) -> bool {
        multicast_id.split('/').any(|segment| segment == "+" || segment == "*")
    }

    fn pattern_for(multicast_id: &str) -> Option<Regex> {
        if !Self::has_wildcard(multicast_id) {
            return None;
        }

        let segments: Vec<&str> = multicast_id.split('/').collect();
        let last = segments.len() - 1;
        let mut pattern = String::from("^");

        for (i, segment) in segments.iter().enumerate() {
            match *segment {
                "*" if i == last => {
                    if i == 0 {
                        pattern.push_str(".*");
                    } else {
                        pattern.push_str("(/.*)?");
                    }
                    break;
                }
                "+" => {
                    if i > 0 {
                        pattern.push('/');
                    }
                    pattern.push_str("[^/]+");
                }
                literal => {
                    if i > 0 {
                        pattern.push('/');
                    }
                    pattern.push_str(&regex::escape(literal));
                }
            }
        }
        pattern.push('$');

        match Regex::new(&pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(multicast_id = %multicast_id, error = %e, "Invalid multicast pattern, matching literally");
                None
            }
        }
    }
}

impl MulticastReceiverRegistry for InMemoryMulticastReceiverRegistry {
    fn register_receiver(&self, multicast_id: &str, participant_id: &str) {
        let mut registrations = self.registrations.write();
        let registration = registrations
            .entry(multicast_id.to_string())
            .or_insert_with(|| Registration {
                pattern: Self::pattern_for(multicast_id),
                receivers: HashSet::new(),
            });
        registration.receivers.insert(participant_id.to_string());
        debug!(multicast_id = %multicast_id, participant_id = %participant_id, "Registered multicast receiver");
    }

    fn unregister_receiver(&self, multicast_id: &str, participant_id: &str) {
        let mut registrations = self.registrations.write();
        if let Some(registration) = registrations.get_mut(multicast_id) {
            registration.receivers.remove(participant_id);
            if registration.receivers.is_empty() {
                registrations.remove(multicast_id);
            }
            debug!(multicast_id = %multicast_id, participant_id = %participant_id, "Unregistered multicast receiver");
        }
    }

    fn get_receivers(&self, multicast_id: &str) -> HashSet<String> {
        let registrations = self.registrations.read();
        let mut receivers = HashSet::new();

        for (registered_id, registration) in registrations.iter() {
            let matches = match &registration.pattern {
                Some(pattern) => pattern.is_match(multicast_id),
                None => registered_id == multicast_id,
            };
            if matches {
                receivers.extend(registration.receivers.iter().cloned());
            }
        }
        receivers
    }
}
