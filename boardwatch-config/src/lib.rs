//! Configuration system for boardwatch.
//!
//! This crate provides configuration loading, saving, validation and default
//! values, and converts the configuration into the options, registry and
//! board catalog used by `boardwatch-discovery`.

pub mod config;
pub mod defaults;
pub mod error;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use error::ConfigError;
pub use types::LogLevel;
