// Library exports for testing and potential library use
//
// # Mutex Usage Policy
//
//   - `tokio::sync::Mutex`: discovery sessions, held across `.await` while a
//     command is in flight.
//   - `parking_lot::Mutex`: short sync-only state (event sinks, pending
//     request tables, the session map, the log file).
//
// Never hold a parking_lot guard across an `.await`.

/// Application version (root crate version, for use by sub-crates).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod app;
pub mod cli;
pub mod logging;
pub mod output;

pub use boardwatch_config as config;
pub use boardwatch_discovery as discovery;
