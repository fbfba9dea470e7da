//! boardwatch-discovery: pluggable board discovery.
//!
//! Connected devices are found by external discovery tools, one subprocess
//! per tool, speaking a line protocol over stdin/stdout. This crate launches
//! and supervises those tools and merges what they report into one port list.
//!
//! # Architecture
//!
//! - [`protocol`] - Command encoding, message decoding, decode health tracking
//! - [`client`] - Request/reply correlation next to unsolicited event pushes
//! - [`session`] - One subprocess and its protocol state machine
//! - [`registry`] - Configured discoveries resolved to executables on disk
//! - [`aggregator`] - Ordered, deduplicated merge of port events
//! - [`boards`] - Board hints matched against port properties
//! - [`manager`] - `list_ports`, `watch` and `shutdown` over every discovery
//!
//! # Example
//!
//! ```ignore
//! use boardwatch_discovery::{DiscoveryManager, DiscoveryRegistry, ManagerOptions};
//!
//! let registry = DiscoveryRegistry::with_defaults(data_dir);
//! let manager = DiscoveryManager::new(registry, ManagerOptions::default());
//!
//! let result = manager.list_ports().await?;
//! for port in &result.ports {
//!     println!("{} {}", port.address, port.protocol_label);
//! }
//! for warning in &result.warnings {
//!     eprintln!("{warning}");
//! }
//! manager.shutdown().await;
//! ```

pub mod aggregator;
pub mod boards;
pub mod client;
pub mod descriptor;
pub mod error;
pub mod manager;
pub mod port;
pub mod protocol;
pub mod registry;
pub mod session;

// Re-export the main public types at the crate root for convenience
pub use aggregator::{PortAggregator, PortSnapshot};
pub use boards::{BoardCatalog, BoardHint};
pub use descriptor::{DiscoveryDescriptor, DiscoveryId, DiscoveryKind};
pub use error::{ManagerError, RegistryError, SessionError};
pub use manager::{DiscoveryManager, ListResult, ListStrategy, ManagerOptions, WatchStream};
pub use port::{BoardMatch, DiscoveryEvent, DiscoveryWarning, Port, PortKey};
pub use registry::{DEFAULT_DISCOVERIES, DiscoveryDefinition, DiscoveryRegistry};
pub use session::{DiscoverySession, SessionOptions, SessionState};
