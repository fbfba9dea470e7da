//! Rendering of port listings, watch events and discovery status.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::discovery::{
    BoardMatch, DiscoveryDescriptor, DiscoveryEvent, DiscoveryId, DiscoveryWarning, Port,
    PortSnapshot, RegistryError,
};

/// Output format of `list` and `watch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// One listed port in the JSON listing schema.
#[derive(Debug, Serialize)]
pub struct PortEntry<'a> {
    pub port: PortOutput<'a>,
}

#[derive(Debug, Serialize)]
pub struct PortOutput<'a> {
    pub address: &'a str,
    pub label: &'a str,
    pub protocol: &'a str,
    pub protocol_label: &'a str,
    pub properties: &'a BTreeMap<String, String>,
    pub hardware_id: &'a str,
    pub boards: &'a [BoardMatch],
}

impl<'a> From<&'a Port> for PortOutput<'a> {
    fn from(port: &'a Port) -> Self {
        Self {
            address: &port.address,
            label: &port.label,
            protocol: &port.protocol,
            protocol_label: &port.protocol_label,
            properties: &port.properties,
            hardware_id: &port.hardware_id,
            boards: &port.boards,
        }
    }
}

/// Listing as a pretty-printed JSON array.
pub fn render_json(ports: &PortSnapshot) -> serde_json::Result<String> {
    let entries: Vec<PortEntry<'_>> = ports
        .iter()
        .map(|port| PortEntry { port: port.into() })
        .collect();
    serde_json::to_string_pretty(&entries)
}

/// Listing as an aligned table.
pub fn render_text(ports: &PortSnapshot) -> String {
    if ports.is_empty() {
        return "No boards found.\n".to_string();
    }
    let headers = ["Port", "Protocol", "Type", "Board Name", "FQBN"];
    let rows: Vec<[String; 5]> = ports
        .iter()
        .map(|port| {
            let (name, fqbn) = match port.boards.first() {
                Some(board) => (board.name.clone(), board.fqbn.clone()),
                None => ("Unknown".to_string(), String::new()),
            };
            [
                port.address.clone(),
                port.protocol.clone(),
                port.protocol_label.clone(),
                name,
                fqbn,
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut write_row = |cells: &[&str]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", line.join(" ").trim_end());
    };
    write_row(&headers);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        write_row(&cells);
    }
    out
}

/// Operator-facing warning line.
pub fn format_warning(warning: &DiscoveryWarning) -> String {
    format!(
        "Error starting discovery {}: {}",
        warning.discovery, warning.reason
    )
}

#[derive(Debug, Serialize)]
#[serde(tag = "eventType", rename_all = "lowercase")]
enum EventOutput<'a> {
    Add {
        discovery: String,
        port: PortOutput<'a>,
    },
    Remove {
        discovery: String,
        protocol: &'a str,
        address: &'a str,
    },
    Error {
        discovery: String,
        message: &'a str,
    },
}

/// One watch event as a single line.
pub fn render_event(event: &DiscoveryEvent, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let output = match event {
                DiscoveryEvent::Added { discovery, port } => EventOutput::Add {
                    discovery: discovery.to_string(),
                    port: port.into(),
                },
                DiscoveryEvent::Removed {
                    discovery,
                    protocol,
                    address,
                } => EventOutput::Remove {
                    discovery: discovery.to_string(),
                    protocol,
                    address,
                },
                DiscoveryEvent::Error { discovery, message } => EventOutput::Error {
                    discovery: discovery.to_string(),
                    message,
                },
            };
            serde_json::to_string(&output).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
        }
        OutputFormat::Text => match event {
            DiscoveryEvent::Added { port, .. } => {
                let board = port
                    .boards
                    .first()
                    .map(|b| format!(" {} ({})", b.name, b.fqbn))
                    .unwrap_or_default();
                format!(
                    "+ {} {} [{}]{board}",
                    port.protocol, port.address, port.protocol_label
                )
            }
            DiscoveryEvent::Removed {
                protocol, address, ..
            } => format!("- {protocol} {address}"),
            DiscoveryEvent::Error { discovery, message } => {
                format!("! {discovery}: {message}")
            }
        },
    }
}

/// Status table for the `discoveries` command.
pub fn render_status(
    status: &[(DiscoveryId, Result<DiscoveryDescriptor, RegistryError>)],
) -> String {
    if status.is_empty() {
        return "No discoveries configured.\n".to_string();
    }
    let width = status
        .iter()
        .map(|(id, _)| id.to_string().len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for (id, result) in status {
        let id = id.to_string();
        let _ = match result {
            Ok(descriptor) => writeln!(
                out,
                "{id:<width$} installed     {} ({})",
                descriptor.executable.display(),
                descriptor.kind
            ),
            Err(e) => writeln!(
                out,
                "{id:<width$} not installed {}",
                crate::discovery::registry::warning_reason(e)
            ),
        };
    }
    out
}
