//! Line codec for the pluggable discovery protocol.
//!
//! Commands are written to the tool's stdin as single text lines
//! (`HELLO 1 "boardwatch 0.1.0"`, `START_SYNC`, ...). The tool answers on
//! stdout with one JSON object per line. Every message carries an
//! `eventType`: replies use the lower-case name of the command they answer,
//! which doubles as the correlation identifier, while `add`, `remove` and
//! `error` are unsolicited pushes.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::port::Port;

/// Highest protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Reply kind a tool uses for a command it did not understand.
pub const COMMAND_ERROR_KIND: &str = "command_error";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A command sent to a discovery tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello {
        protocol_version: u32,
        user_agent: String,
    },
    Start,
    StartSync,
    Stop,
    List,
    Quit,
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Start => "START",
            Self::StartSync => "START_SYNC",
            Self::Stop => "STOP",
            Self::List => "LIST",
            Self::Quit => "QUIT",
        }
    }

    /// `eventType` of the reply that answers this command.
    pub fn reply_kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Start => "start",
            Self::StartSync => "start_sync",
            Self::Stop => "stop",
            Self::List => "list",
            Self::Quit => "quit",
        }
    }

    /// Serialize into exactly one newline-terminated line.
    pub fn encode(&self) -> String {
        match self {
            Self::Hello {
                protocol_version,
                user_agent,
            } => {
                let escaped = user_agent
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace(['\n', '\r'], " ");
                format!("HELLO {protocol_version} \"{escaped}\"\n")
            }
            other => format!("{}\n", other.name()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Reply to a command, correlated by [`CommandReply::kind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub kind: String,
    pub message: String,
    pub error: bool,
    pub protocol_version: Option<u32>,
    pub ports: Vec<Port>,
    /// Why listed ports were dropped; the valid ones are still in `ports`.
    pub skipped: Vec<DecodeError>,
}

impl CommandReply {
    /// A reply is successful when it is not flagged as an error and its
    /// message is `OK`. A `list` reply carries ports instead of a message.
    pub fn is_ok(&self) -> bool {
        if self.error || self.kind == COMMAND_ERROR_KIND {
            return false;
        }
        (self.kind == "list" && self.message.is_empty()) || self.message.eq_ignore_ascii_case("ok")
    }
}

/// One decoded line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    Reply(CommandReply),
    Added(Port),
    Removed { protocol: String, address: String },
    /// Error pushed by the tool outside any command.
    Failure(String),
}

/// Why a line could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Syntax(String),
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
    #[error("'{kind}' message is missing field '{field}'")]
    MissingField { kind: String, field: &'static str },
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    event_type: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    protocol_version: Option<u32>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default)]
    ports: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RemovedPort {
    address: String,
    #[serde(default)]
    protocol: String,
}

fn parse_port(value: Value) -> Result<Port, DecodeError> {
    let port: Port =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidPort(e.to_string()))?;
    port.normalized().map_err(DecodeError::InvalidPort)
}

/// Decode one line of tool output.
pub fn decode_line(line: &str) -> Result<DiscoveryMessage, DecodeError> {
    let raw: RawMessage =
        serde_json::from_str(line.trim()).map_err(|e| DecodeError::Syntax(e.to_string()))?;

    match raw.event_type.as_str() {
        "add" => {
            let port = raw.port.ok_or(DecodeError::MissingField {
                kind: raw.event_type.clone(),
                field: "port",
            })?;
            Ok(DiscoveryMessage::Added(parse_port(port)?))
        }
        "remove" => {
            let port = raw.port.ok_or(DecodeError::MissingField {
                kind: raw.event_type.clone(),
                field: "port",
            })?;
            let removed: RemovedPort = serde_json::from_value(port)
                .map_err(|e| DecodeError::InvalidPort(e.to_string()))?;
            if removed.protocol.is_empty() {
                return Err(DecodeError::InvalidPort(format!(
                    "removed port '{}' has an empty protocol",
                    removed.address
                )));
            }
            Ok(DiscoveryMessage::Removed {
                protocol: removed.protocol,
                address: removed.address,
            })
        }
        "error" => Ok(DiscoveryMessage::Failure(
            raw.message.unwrap_or_else(|| "unspecified error".to_string()),
        )),
        "hello" | "start" | "start_sync" | "stop" | "list" | "quit" | COMMAND_ERROR_KIND => {
            let mut ports = Vec::new();
            let mut skipped = Vec::new();
            for value in raw.ports.unwrap_or_default() {
                match parse_port(value) {
                    Ok(port) => ports.push(port),
                    Err(e) => skipped.push(e),
                }
            }
            Ok(DiscoveryMessage::Reply(CommandReply {
                kind: raw.event_type,
                message: raw.message.unwrap_or_default(),
                error: raw.error,
                protocol_version: raw.protocol_version,
                ports,
                skipped,
            }))
        }
        _ => Err(DecodeError::UnknownKind(raw.event_type)),
    }
}

// ---------------------------------------------------------------------------
// Decode health
// ---------------------------------------------------------------------------

/// Counts malformed lines and decides when a session becomes unhealthy.
///
/// Only consecutive failures inside `window` count towards `threshold`; a
/// good line resets the streak.
#[derive(Debug, Clone)]
pub struct DecodeTracker {
    threshold: u32,
    window: Duration,
    consecutive: u32,
    streak_started: Option<Instant>,
    total: u64,
    unhealthy: bool,
}

impl DecodeTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            consecutive: 0,
            streak_started: None,
            total: 0,
            unhealthy: false,
        }
    }

    /// Record a malformed line. Returns `true` exactly once, when the session
    /// first crosses the threshold.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.total += 1;
        match self.streak_started {
            Some(start) if now.duration_since(start) <= self.window => self.consecutive += 1,
            _ => {
                self.streak_started = Some(now);
                self.consecutive = 1;
            }
        }
        if self.consecutive >= self.threshold && !self.unhealthy {
            self.unhealthy = true;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
        self.streak_started = None;
    }

    pub fn total_failures(&self) -> u64 {
        self.total
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy
    }
}

impl Default for DecodeTracker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(10))
    }
}
