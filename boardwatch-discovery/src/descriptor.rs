//! Discovery identity and resolved launch descriptors.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Identifier of one pluggable discovery tool, in `vendor:tool-name` form
/// (for example `builtin:serial-discovery`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DiscoveryId {
    vendor: String,
    tool: String,
}

impl DiscoveryId {
    /// Parse and validate a `vendor:tool-name` identifier.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidId`] when either half is empty, contains
    /// whitespace, or the separator is missing or repeated.
    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidId(value.to_string());
        let (vendor, tool) = value.split_once(':').ok_or_else(invalid)?;
        let valid_half = |s: &str| !s.is_empty() && !s.contains(':') && !s.contains(char::is_whitespace);
        if !valid_half(vendor) || !valid_half(tool) {
            return Err(invalid());
        }
        Ok(Self {
            vendor: vendor.to_string(),
            tool: tool.to_string(),
        })
    }

    /// The packager half (`builtin` in `builtin:serial-discovery`).
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// The tool half (`serial-discovery` in `builtin:serial-discovery`).
    pub fn tool(&self) -> &str {
        &self.tool
    }
}

impl fmt::Display for DiscoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vendor, self.tool)
    }
}

impl FromStr for DiscoveryId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DiscoveryId {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DiscoveryId> for String {
    fn from(id: DiscoveryId) -> Self {
        id.to_string()
    }
}

/// Transport family a discovery tool detects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    Serial,
    Network,
    #[serde(untagged)]
    Other(String),
}

impl DiscoveryKind {
    /// Guess the kind from a tool name.
    pub fn from_tool_name(tool: &str) -> Self {
        let lower = tool.to_ascii_lowercase();
        if lower.starts_with("serial") {
            Self::Serial
        } else if lower.starts_with("mdns") || lower.starts_with("network") {
            Self::Network
        } else {
            Self::Other(lower)
        }
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::Network => f.write_str("network"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// A discovery tool resolved to something that can be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryDescriptor {
    pub id: DiscoveryId,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub kind: DiscoveryKind,
}

impl DiscoveryDescriptor {
    /// Descriptor for a tool launched without arguments, kind guessed from its name.
    pub fn new(id: DiscoveryId, executable: impl Into<PathBuf>) -> Self {
        let kind = DiscoveryKind::from_tool_name(id.tool());
        Self {
            id,
            executable: executable.into(),
            args: Vec::new(),
            kind,
        }
    }
}
