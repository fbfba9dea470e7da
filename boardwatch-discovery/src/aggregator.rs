//! Merged view of the ports reported by every discovery.

use indexmap::IndexMap;

use crate::descriptor::DiscoveryId;
use crate::port::{DiscoveryEvent, Port, PortKey};

/// Ordered, deduplicated list of ports.
///
/// Order is the first time each key was seen; an update keeps the position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSnapshot {
    ports: Vec<Port>,
}

impl PortSnapshot {
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Port> {
        self.ports.iter()
    }

    pub fn get(&self, key: &PortKey) -> Option<&Port> {
        self.ports
            .iter()
            .find(|p| p.protocol == key.protocol && p.address == key.address)
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.ports.iter().map(|p| p.address.as_str()).collect()
    }

    pub fn as_slice(&self) -> &[Port] {
        &self.ports
    }

    pub(crate) fn ports_mut(&mut self) -> &mut [Port] {
        &mut self.ports
    }
}

impl IntoIterator for PortSnapshot {
    type Item = Port;
    type IntoIter = std::vec::IntoIter<Port>;

    fn into_iter(self) -> Self::IntoIter {
        self.ports.into_iter()
    }
}

impl<'a> IntoIterator for &'a PortSnapshot {
    type Item = &'a Port;
    type IntoIter = std::slice::Iter<'a, Port>;

    fn into_iter(self) -> Self::IntoIter {
        self.ports.iter()
    }
}

impl FromIterator<Port> for PortSnapshot {
    fn from_iter<I: IntoIterator<Item = Port>>(iter: I) -> Self {
        let mut merged: IndexMap<PortKey, Port> = IndexMap::new();
        for port in iter {
            merged.insert(port.key(), port);
        }
        Self {
            ports: merged.into_values().collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    owner: DiscoveryId,
    port: Port,
}

/// Applies discovery events to the merged port set.
///
/// Single-owner: whoever holds the aggregator is the only writer.
#[derive(Debug, Clone, Default)]
pub struct PortAggregator {
    entries: IndexMap<PortKey, Entry>,
}

impl PortAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event.
    ///
    /// `Removed` only deletes a port the same discovery owns, so a stale
    /// removal never drops another discovery's port. `Error` drops every port
    /// of the failing discovery.
    pub fn apply(&mut self, event: &DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added { discovery, port } => {
                self.insert(discovery.clone(), port.clone());
            }
            DiscoveryEvent::Removed {
                discovery,
                protocol,
                address,
            } => {
                let key = PortKey::new(protocol, address);
                match self.entries.get(&key) {
                    Some(entry) if &entry.owner == discovery => {
                        self.entries.shift_remove(&key);
                    }
                    Some(entry) => log::debug!(
                        "discovery {discovery}: ignoring removal of {key} owned by {}",
                        entry.owner
                    ),
                    None => log::debug!("discovery {discovery}: removal of unknown port {key}"),
                }
            }
            DiscoveryEvent::Error { discovery, .. } => self.drop_discovery(discovery),
        }
    }

    fn insert(&mut self, owner: DiscoveryId, port: Port) {
        let key = port.key();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.owner = owner;
                entry.port = port;
            }
            None => {
                self.entries.insert(key, Entry { owner, port });
            }
        }
    }

    /// Remove every port contributed by `discovery`.
    pub fn drop_discovery(&mut self, discovery: &DiscoveryId) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| &entry.owner != discovery);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            log::info!("discovery {discovery}: dropped {dropped} port(s)");
        }
    }

    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            ports: self.entries.values().map(|e| e.port.clone()).collect(),
        }
    }

    /// Ports currently owned by `discovery`, in snapshot order.
    pub fn ports_of(&self, discovery: &DiscoveryId) -> Vec<&Port> {
        self.entries
            .values()
            .filter(|e| &e.owner == discovery)
            .map(|e| &e.port)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
