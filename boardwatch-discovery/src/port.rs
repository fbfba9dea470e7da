//! Discovered ports and the events that announce them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::DiscoveryId;

/// Candidate board identified for a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardMatch {
    pub name: String,
    pub fqbn: String,
}

/// One discovered, addressable device endpoint.
///
/// Field names follow the discovery wire format (`protocolLabel`,
/// `hardwareId`); listing output uses its own snake_case schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub address: String,
    #[serde(default)]
    pub label: String,
    pub protocol: String,
    #[serde(default)]
    pub protocol_label: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub hardware_id: String,
    /// Filled by board hints, never by the discovery tool.
    #[serde(skip)]
    pub boards: Vec<BoardMatch>,
}

impl Port {
    /// Minimal port with the label defaulted to the address.
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        let protocol = protocol.into();
        let address = address.into();
        Self {
            label: address.clone(),
            protocol_label: protocol.clone(),
            address,
            protocol,
            properties: BTreeMap::new(),
            hardware_id: String::new(),
            boards: Vec::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Builder-style protocol label setter.
    pub fn with_protocol_label(mut self, label: impl Into<String>) -> Self {
        self.protocol_label = label.into();
        self
    }

    pub fn key(&self) -> PortKey {
        PortKey::new(&self.protocol, &self.address)
    }

    /// Enforce the boundary invariants of a port coming off the wire.
    ///
    /// The protocol must be non-empty. A missing protocol label falls back to
    /// the protocol and a missing label to the address.
    pub fn normalized(mut self) -> Result<Self, String> {
        if self.protocol.trim().is_empty() {
            return Err(format!("port '{}' has an empty protocol", self.address));
        }
        if self.address.is_empty() {
            return Err("port has an empty address".to_string());
        }
        if self.protocol_label.trim().is_empty() {
            self.protocol_label = self.protocol.clone();
        }
        if self.label.is_empty() {
            self.label = self.address.clone();
        }
        Ok(self)
    }
}

/// Unique key of a port inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    pub protocol: String,
    pub address: String,
}

impl PortKey {
    pub fn new(protocol: &str, address: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            address: address.to_string(),
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.address)
    }
}

/// Event produced by a discovery session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A port appeared, or was re-announced with updated properties.
    Added { discovery: DiscoveryId, port: Port },
    /// A port disappeared.
    Removed {
        discovery: DiscoveryId,
        protocol: String,
        address: String,
    },
    /// The discovery failed; its ports are no longer trustworthy.
    Error { discovery: DiscoveryId, message: String },
}

impl DiscoveryEvent {
    /// The discovery that produced this event.
    pub fn discovery(&self) -> &DiscoveryId {
        match self {
            Self::Added { discovery, .. }
            | Self::Removed { discovery, .. }
            | Self::Error { discovery, .. } => discovery,
        }
    }
}

/// Non-fatal per-discovery failure returned next to a successful result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryWarning {
    pub discovery: DiscoveryId,
    pub reason: String,
}

impl DiscoveryWarning {
    pub fn new(discovery: DiscoveryId, reason: impl Into<String>) -> Self {
        Self {
            discovery,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "discovery {}: {}", self.discovery, self.reason)
    }
}
