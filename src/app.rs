//! Wiring between the CLI, the configuration and the discovery manager.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cli::Commands;
use crate::config::Config;
use crate::discovery::{DiscoveryManager, ManagerError};
use crate::output::{self, OutputFormat};

/// Loaded configuration and where it came from.
#[derive(Debug, Clone)]
pub struct App {
    pub config: Config,
    pub config_path: PathBuf,
}

impl App {
    /// Load the configuration from `path`, or the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Config::config_path);
        let config = Config::load_from(&config_path)
            .with_context(|| format!("failed to load config {}", config_path.display()))?;
        Ok(Self {
            config,
            config_path,
        })
    }

    /// Manager over the configured discoveries and custom definitions.
    pub fn build_manager(&self) -> Result<DiscoveryManager, ManagerError> {
        let definitions = Config::definitions_dir(&self.config_path);
        let registry = self.config.build_registry(&definitions)?;
        Ok(
            DiscoveryManager::new(registry, self.config.manager_options())
                .with_board_catalog(self.config.board_catalog()),
        )
    }

    /// Run one CLI command. The manager is always shut down before
    /// returning so no discovery process outlives the call.
    pub async fn run(&self, command: Commands) -> Result<()> {
        let manager = self.build_manager()?;
        let result = match command {
            Commands::List { format } => {
                list(
                    &manager,
                    format,
                    &mut std::io::stdout(),
                    &mut std::io::stderr(),
                )
                .await
            }
            Commands::Watch { format } => watch(&manager, format).await,
            Commands::Discoveries => {
                let status = manager.registry().status();
                print!("{}", output::render_status(&status));
                Ok(())
            }
        };
        manager.shutdown().await;
        result
    }
}

/// Run `list_ports` and print the ports on `out`, warnings on `err`.
///
/// Each warning is logged once here at `warn`; the core logs the same
/// failures at `debug` only.
pub async fn list(
    manager: &DiscoveryManager,
    format: OutputFormat,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<()> {
    let result = manager.list_ports().await?;
    for warning in &result.warnings {
        log::warn!("{warning}");
        writeln!(err, "{}", output::format_warning(warning))?;
    }
    match format {
        OutputFormat::Json => writeln!(out, "{}", output::render_json(&result.ports)?)?,
        OutputFormat::Text => write!(out, "{}", output::render_text(&result.ports))?,
    }
    out.flush()?;
    Ok(())
}

/// Stream events to stdout until Ctrl-C or the stream ends.
pub async fn watch(manager: &DiscoveryManager, format: OutputFormat) -> Result<()> {
    let mut stream = manager.watch().await?;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                writeln!(stdout, "{}", output::render_event(&event, format))?;
                stdout.flush()?;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error!("cannot listen for Ctrl-C: {e}");
                }
                log::info!("interrupted, stopping watch");
                break;
            }
        }
    }
    stream.cancel().await?;
    Ok(())
}
