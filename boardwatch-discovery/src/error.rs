//! Error types for discovery sessions, the registry and the manager.
//!
//! Session and registry errors are per-discovery: the manager turns them into
//! [`crate::DiscoveryWarning`]s. Only [`ManagerError`] escapes `list_ports`
//! and `watch`.

use std::path::PathBuf;

use thiserror::Error;

use crate::descriptor::DiscoveryId;
use crate::protocol::DecodeError;

/// Failure of a single discovery session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The executable could not be launched.
    #[error("failed to spawn '{}': {source}", path.display())]
    SpawnFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The tool did not answer `HELLO` in time.
    #[error("handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    /// The tool answered `HELLO` with an error or an unsupported version.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A line from the tool could not be decoded.
    #[error("protocol error: {0}")]
    ProtocolDecode(#[from] DecodeError),

    /// The process exited or closed its output outside a requested quit.
    #[error("process exited unexpectedly: {0}")]
    UnexpectedExit(String),

    /// A command did not get a reply in time.
    #[error("command {command} timed out after {millis}ms")]
    CommandTimeout { command: String, millis: u64 },

    /// The tool replied to a command with an error.
    #[error("command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The command is not valid in the session's current state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Writing to the tool's stdin failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to resolve a discovery identifier to an executable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Not a `vendor:tool-name` identifier.
    #[error("invalid discovery identifier '{0}' (expected vendor:tool-name)")]
    InvalidId(String),

    /// The identifier is not part of the configuration.
    #[error("discovery {0} is not configured")]
    Unknown(DiscoveryId),

    /// Configured but missing or broken on disk.
    #[error("discovery {id} is not installed: {reason}")]
    NotInstalled { id: DiscoveryId, reason: String },

    /// The registry's own sources could not be read.
    #[error("cannot enumerate discoveries in '{}': {message}", path.display())]
    Enumerate { path: PathBuf, message: String },
}

/// Fatal error of a whole manager operation.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A watch stream is still active; sessions are busy feeding it.
    #[error("a watch is already in progress")]
    WatchInProgress,

    /// A session worker task panicked or was cancelled.
    #[error("discovery worker failed: {0}")]
    Worker(String),

    /// The registry could not be enumerated at all.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type SessionResult<T> = Result<T, SessionError>;
