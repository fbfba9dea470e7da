//! Default values for configuration fields.

use std::path::PathBuf;

// ── Paths ──────────────────────────────────────────────────────────────────

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("boardwatch"))
        .unwrap_or_else(|| PathBuf::from(".boardwatch"))
}

// ── Discoveries ────────────────────────────────────────────────────────────

pub fn discoveries() -> Vec<String> {
    boardwatch_discovery::DEFAULT_DISCOVERIES
        .iter()
        .map(|id| id.to_string())
        .collect()
}

pub fn user_agent() -> String {
    format!("boardwatch {}", env!("CARGO_PKG_VERSION"))
}

// ── Timing (milliseconds) ──────────────────────────────────────────────────

pub fn handshake_timeout_ms() -> u64 {
    10_000
}

pub fn command_timeout_ms() -> u64 {
    10_000
}

pub fn settle_quiet_ms() -> u64 {
    1_000
}

pub fn list_timeout_ms() -> u64 {
    10_000
}

pub fn quit_grace_ms() -> u64 {
    2_000
}

// ── Decode health ──────────────────────────────────────────────────────────

pub fn decode_failure_threshold() -> u32 {
    3
}

pub fn decode_window_ms() -> u64 {
    10_000
}
