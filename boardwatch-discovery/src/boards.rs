//! Board hints: match port properties against a catalog of known boards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregator::PortSnapshot;
use crate::port::{BoardMatch, Port};

/// One known board and the port properties that identify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardHint {
    pub name: String,
    pub fqbn: String,
    /// Every entry must be present on the port with an equal value.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl BoardHint {
    /// Whether the port carries all identifying properties. Values compare
    /// ASCII case-insensitively (`0x2341` matches `0X2341`). A hint without
    /// properties matches nothing.
    pub fn matches(&self, port: &Port) -> bool {
        !self.properties.is_empty()
            && self.properties.iter().all(|(key, want)| {
                port.properties
                    .get(key)
                    .is_some_and(|have| have.eq_ignore_ascii_case(want))
            })
    }
}

/// Ordered list of board hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardCatalog {
    hints: Vec<BoardHint>,
}

impl BoardCatalog {
    pub fn new(hints: Vec<BoardHint>) -> Self {
        Self { hints }
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    pub fn hints(&self) -> &[BoardHint] {
        &self.hints
    }

    /// Matching boards for one port, in catalog order.
    pub fn identify(&self, port: &Port) -> Vec<BoardMatch> {
        self.hints
            .iter()
            .filter(|hint| hint.matches(port))
            .map(|hint| BoardMatch {
                name: hint.name.clone(),
                fqbn: hint.fqbn.clone(),
            })
            .collect()
    }

    /// Fill `boards` on every port of the snapshot.
    pub fn annotate(&self, snapshot: &mut PortSnapshot) {
        if self.is_empty() {
            return;
        }
        for port in snapshot.ports_mut() {
            port.boards = self.identify(port);
        }
    }
}
