//! The `Config` struct, its persistence, and conversion to discovery options.
//!
//! Covers:
//! - `load` / `load_from` / `save_to` (YAML file I/O with atomic write)
//! - XDG-style path helpers (`config_path`, `config_dir`, `definitions_dir`)
//! - `validate`
//! - Builders for the discovery manager (`manager_options`, `build_registry`)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use boardwatch_discovery::{
    BoardCatalog, BoardHint, DiscoveryId, DiscoveryRegistry, ListStrategy, ManagerOptions,
    RegistryError, SessionOptions,
};
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::ConfigError;
use crate::types::LogLevel;

/// Configuration of the boardwatch CLI.
///
/// Every field has a default, so an empty or partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Install root holding `packages/<vendor>/tools/...`.
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,

    /// Discoveries to run, in query order (`vendor:tool-name`).
    #[serde(default = "defaults::discoveries")]
    pub discoveries: Vec<String>,

    /// Sent to every tool in the `HELLO` handshake.
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    #[serde(default = "defaults::handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "defaults::command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Quiet period after which a listing is considered complete.
    #[serde(default = "defaults::settle_quiet_ms")]
    pub settle_quiet_ms: u64,

    /// Overall bound of a listing.
    #[serde(default = "defaults::list_timeout_ms")]
    pub list_timeout_ms: u64,

    /// Time a tool gets to exit after `QUIT` before it is killed.
    #[serde(default = "defaults::quit_grace_ms")]
    pub quit_grace_ms: u64,

    #[serde(default = "defaults::decode_failure_threshold")]
    pub decode_failure_threshold: u32,

    #[serde(default = "defaults::decode_window_ms")]
    pub decode_window_ms: u64,

    #[serde(default)]
    pub list_strategy: ListStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Board hints matched against port properties.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boards: Vec<BoardHint>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: defaults::data_dir(),
            discoveries: defaults::discoveries(),
            user_agent: defaults::user_agent(),
            handshake_timeout_ms: defaults::handshake_timeout_ms(),
            command_timeout_ms: defaults::command_timeout_ms(),
            settle_quiet_ms: defaults::settle_quiet_ms(),
            list_timeout_ms: defaults::list_timeout_ms(),
            quit_grace_ms: defaults::quit_grace_ms(),
            decode_failure_threshold: defaults::decode_failure_threshold(),
            decode_window_ms: defaults::decode_window_ms(),
            list_strategy: ListStrategy::default(),
            log_level: None,
            log_file: None,
            boards: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the default [`config_path`](Self::config_path).
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults when it does not exist.
    ///
    /// The loaded configuration is validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        log::info!("Config path: {:?}", path);
        if !path.exists() {
            log::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(ConfigError::from)?;
        let config: Config = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(&contents).map_err(ConfigError::from)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::from)?;
        }
        let yaml = serde_yaml_ng::to_string(self).map_err(ConfigError::from)?;

        // Atomic save: write to temp file then rename to prevent corruption on crash
        let temp_path = path.with_extension("yaml.tmp");
        fs::write(&temp_path, &yaml).map_err(ConfigError::from)?;
        fs::rename(&temp_path, path).map_err(ConfigError::from)?;
        Ok(())
    }

    /// Get the configuration file path (using XDG convention)
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.yaml")
    }

    /// Get the configuration directory path (using XDG convention)
    pub fn config_dir() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            if let Some(config_dir) = dirs::config_dir() {
                config_dir.join("boardwatch")
            } else {
                PathBuf::from(".")
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            // Use XDG convention on all platforms: ~/.config/boardwatch
            if let Some(home_dir) = dirs::home_dir() {
                home_dir.join(".config").join("boardwatch")
            } else {
                PathBuf::from(".")
            }
        }
    }

    /// Directory of custom discovery definitions next to `config_file`.
    pub fn definitions_dir(config_file: &Path) -> PathBuf {
        config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_dir)
            .join("discoveries")
    }

    /// Check field values.
    ///
    /// # Errors
    /// [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("settle_quiet_ms", self.settle_quiet_ms),
            ("list_timeout_ms", self.list_timeout_ms),
            ("quit_grace_ms", self.quit_grace_ms),
            ("decode_window_ms", self.decode_window_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{name} must be greater than 0")));
        }
        if self.decode_failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "decode_failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.settle_quiet_ms > self.list_timeout_ms {
            return Err(ConfigError::Validation(format!(
                "settle_quiet_ms ({}) must not exceed list_timeout_ms ({})",
                self.settle_quiet_ms, self.list_timeout_ms
            )));
        }
        self.discovery_ids()?;
        for (index, board) in self.boards.iter().enumerate() {
            if board.fqbn.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "boards[{index}] ({}) has an empty fqbn",
                    board.name
                )));
            }
        }
        Ok(())
    }

    /// Parsed discovery identifiers, in configured order.
    pub fn discovery_ids(&self) -> Result<Vec<DiscoveryId>, ConfigError> {
        self.discoveries
            .iter()
            .map(|raw| {
                DiscoveryId::parse(raw)
                    .map_err(|e| ConfigError::Validation(format!("discoveries: {e}")))
            })
            .collect()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            user_agent: self.user_agent.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            quit_grace: Duration::from_millis(self.quit_grace_ms),
            decode_failure_threshold: self.decode_failure_threshold,
            decode_window: Duration::from_millis(self.decode_window_ms),
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            session: self.session_options(),
            settle_quiet: Duration::from_millis(self.settle_quiet_ms),
            list_timeout: Duration::from_millis(self.list_timeout_ms),
            strategy: self.list_strategy,
        }
    }

    pub fn board_catalog(&self) -> BoardCatalog {
        BoardCatalog::new(self.boards.clone())
    }

    /// Registry over `data_dir` with the configured discoveries plus the
    /// custom definitions found in `definitions_dir`.
    ///
    /// # Errors
    /// [`RegistryError::InvalidId`] for a bad identifier and
    /// [`RegistryError::Enumerate`] if `definitions_dir` cannot be read.
    pub fn build_registry(&self, definitions_dir: &Path) -> Result<DiscoveryRegistry, RegistryError> {
        let ids = self
            .discoveries
            .iter()
            .map(|raw| DiscoveryId::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let definitions = DiscoveryRegistry::load_definitions(definitions_dir)?;
        log::debug!(
            "registry: {} configured, {} custom definition(s)",
            ids.len(),
            definitions.len()
        );
        Ok(DiscoveryRegistry::new(&self.data_dir, ids).with_definitions(definitions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_from(&tmp.path().join("config.yaml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.discoveries,
            vec!["builtin:serial-discovery", "builtin:mdns-discovery"]
        );
        assert_eq!(config.list_strategy, ListStrategy::Sync);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(
            &path,
            "settle_quiet_ms: 250\nlist_strategy: poll\nlog_level: debug\n",
        )
        .unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.settle_quiet_ms, 250);
        assert_eq!(config.list_strategy, ListStrategy::Poll);
        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.command_timeout_ms, 10_000);
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.yaml");
        let mut config = Config {
            data_dir: tmp.path().join("data"),
            discoveries: vec!["teensy:teensy-discovery".to_string()],
            ..Config::default()
        };
        config.boards.push(BoardHint {
            name: "Arduino Uno".to_string(),
            fqbn: "arduino:avr:uno".to_string(),
            properties: [("vid".to_string(), "0x2341".to_string())].into(),
        });
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_parse_error_is_typed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(&path, "settle_quiet_ms: [not, a, number]\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = Config {
            quit_grace_ms: 0,
            ..Config::default()
        };
        assert!(matches!(zero.validate(), Err(ConfigError::Validation(m)) if m.contains("quit_grace_ms")));

        let settle = Config {
            settle_quiet_ms: 20_000,
            ..Config::default()
        };
        assert!(settle.validate().is_err());

        let threshold = Config {
            decode_failure_threshold: 0,
            ..Config::default()
        };
        assert!(threshold.validate().is_err());

        let id = Config {
            discoveries: vec!["serial-discovery".to_string()],
            ..Config::default()
        };
        assert!(matches!(id.validate(), Err(ConfigError::Validation(m)) if m.contains("serial-discovery")));
    }

    #[test]
    fn test_options_conversion() {
        let config = Config {
            settle_quiet_ms: 300,
            quit_grace_ms: 500,
            ..Config::default()
        };
        let options = config.manager_options();
        assert_eq!(options.settle_quiet, Duration::from_millis(300));
        assert_eq!(options.session.quit_grace, Duration::from_millis(500));
        assert_eq!(options.session.decode_failure_threshold, 3);
    }

    #[test]
    fn test_build_registry_with_definitions() {
        let tmp = tempfile::tempdir().unwrap();
        let defs = tmp.path().join("discoveries");
        fs::create_dir_all(&defs).unwrap();
        fs::write(
            defs.join("extra.toml"),
            "id = \"vendor:extra-discovery\"\ncommand = \"sh\"\n",
        )
        .unwrap();
        let config = Config {
            data_dir: tmp.path().join("data"),
            ..Config::default()
        };
        let registry = config.build_registry(&defs).unwrap();
        let ids: Vec<String> = registry.configured().iter().map(|id| id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "builtin:serial-discovery",
                "builtin:mdns-discovery",
                "vendor:extra-discovery"
            ]
        );
    }

    #[test]
    fn test_definitions_dir_is_next_to_config() {
        let dir = Config::definitions_dir(Path::new("/etc/boardwatch/config.yaml"));
        assert_eq!(dir, PathBuf::from("/etc/boardwatch/discoveries"));
    }
}
