//! Command-line interface for boardwatch.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::output::OutputFormat;

/// boardwatch - find boards attached to this machine
#[derive(Debug, Parser)]
#[command(name = "boardwatch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: ~/.config/boardwatch/config.yaml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, global = true, value_name = "LEVEL", value_parser = parse_level)]
    pub log_level: Option<LevelFilter>,
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    value
        .parse()
        .map_err(|_| format!("invalid log level '{value}'"))
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List the ports currently reported by every discovery
    List {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Stream port changes until interrupted
    Watch {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show every configured discovery and whether it is installed
    Discoveries,
}
