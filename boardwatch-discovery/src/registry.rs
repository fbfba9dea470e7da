//! Configured discoveries and their resolution to executables.
//!
//! Builtin tools live in the package install tree:
//!
//! ```text
//! <install_root>/packages/<vendor>/tools/<tool>/<version>/<tool>[.exe]
//! ```
//!
//! The newest version directory is used. Resolution happens at lookup time,
//! so an installation that was interrupted midway (empty or partial version
//! directory) is reported as not installed instead of failing at spawn.
//!
//! Custom tools can be declared with TOML files in a definitions directory;
//! they override the install tree for the same identifier.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::descriptor::{DiscoveryDescriptor, DiscoveryId, DiscoveryKind};
use crate::error::RegistryError;
use crate::port::DiscoveryWarning;

/// Discoveries enabled when the configuration does not list any.
pub const DEFAULT_DISCOVERIES: &[&str] = &["builtin:serial-discovery", "builtin:mdns-discovery"];

/// A discovery declared in a TOML definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDefinition {
    pub id: DiscoveryId,
    /// Program and arguments, split with shell quoting rules.
    pub command: String,
    #[serde(default)]
    pub kind: Option<DiscoveryKind>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl DiscoveryDefinition {
    /// Defaults to `true` when not specified.
    pub fn is_active(&self) -> bool {
        self.active.unwrap_or(true)
    }
}

/// Set of configured discoveries and where to find them.
#[derive(Debug, Clone)]
pub struct DiscoveryRegistry {
    install_root: PathBuf,
    configured: Vec<DiscoveryId>,
    custom: HashMap<DiscoveryId, DiscoveryDefinition>,
}

impl DiscoveryRegistry {
    pub fn new(install_root: impl Into<PathBuf>, configured: Vec<DiscoveryId>) -> Self {
        let mut unique = Vec::with_capacity(configured.len());
        for id in configured {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        Self {
            install_root: install_root.into(),
            configured: unique,
            custom: HashMap::new(),
        }
    }

    /// Registry for the [`DEFAULT_DISCOVERIES`].
    pub fn with_defaults(install_root: impl Into<PathBuf>) -> Self {
        let ids = DEFAULT_DISCOVERIES
            .iter()
            .filter_map(|s| DiscoveryId::parse(s).ok())
            .collect();
        Self::new(install_root, ids)
    }

    /// Add custom definitions. Active ones become configured (appended in
    /// the order given) and override the install tree for their id.
    pub fn with_definitions(mut self, definitions: Vec<DiscoveryDefinition>) -> Self {
        for definition in definitions {
            if !definition.is_active() {
                log::debug!("discovery {}: definition inactive, skipping", definition.id);
                continue;
            }
            if !self.configured.contains(&definition.id) {
                self.configured.push(definition.id.clone());
            }
            self.custom.insert(definition.id.clone(), definition);
        }
        self
    }

    /// Load every `*.toml` definition from `dir`, sorted by file name.
    ///
    /// A missing directory yields no definitions; unparsable files are
    /// logged and skipped.
    ///
    /// # Errors
    /// [`RegistryError::Enumerate`] if the directory exists but cannot be read.
    pub fn load_definitions(dir: &Path) -> Result<Vec<DiscoveryDefinition>, RegistryError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RegistryError::Enumerate {
                    path: dir.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut definitions = Vec::new();
        for path in paths {
            match std::fs::read_to_string(&path) {
                Ok(content) => match toml::from_str::<DiscoveryDefinition>(&content) {
                    Ok(definition) => {
                        definitions.retain(|d: &DiscoveryDefinition| d.id != definition.id);
                        definitions.push(definition);
                    }
                    Err(e) => {
                        log::error!("Failed to parse discovery definition {}: {e}", path.display());
                    }
                },
                Err(e) => log::error!("Failed to read discovery definition {}: {e}", path.display()),
            }
        }
        Ok(definitions)
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Configured identifiers in query order.
    pub fn configured(&self) -> &[DiscoveryId] {
        &self.configured
    }

    pub fn is_configured(&self, id: &DiscoveryId) -> bool {
        self.configured.contains(id)
    }

    /// Directory holding the installed versions of a builtin tool.
    pub fn tool_dir(&self, id: &DiscoveryId) -> PathBuf {
        self.install_root
            .join("packages")
            .join(id.vendor())
            .join("tools")
            .join(id.tool())
    }

    /// Resolve a configured identifier to a launchable descriptor.
    ///
    /// # Errors
    /// [`RegistryError::Unknown`] when the id is not configured and
    /// [`RegistryError::NotInstalled`] when it is configured but missing or
    /// broken on disk.
    pub fn resolve(&self, id: &DiscoveryId) -> Result<DiscoveryDescriptor, RegistryError> {
        if !self.is_configured(id) {
            return Err(RegistryError::Unknown(id.clone()));
        }
        let not_installed = |reason: String| RegistryError::NotInstalled {
            id: id.clone(),
            reason,
        };

        if let Some(definition) = self.custom.get(id) {
            return resolve_definition(definition).map_err(not_installed);
        }

        let version_dir = newest_version_dir(&self.tool_dir(id)).map_err(not_installed)?;
        let executable = find_executable(&version_dir, id.tool()).map_err(not_installed)?;
        Ok(DiscoveryDescriptor::new(id.clone(), executable))
    }

    /// Resolve every configured discovery, in configured order.
    pub fn resolve_all(&self) -> (Vec<DiscoveryDescriptor>, Vec<DiscoveryWarning>) {
        let mut descriptors = Vec::new();
        let mut warnings = Vec::new();
        for (id, result) in self.status() {
            match result {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    log::debug!("discovery {id}: {e}");
                    warnings.push(DiscoveryWarning::new(id, warning_reason(&e)));
                }
            }
        }
        (descriptors, warnings)
    }

    /// Resolution outcome of every configured discovery.
    pub fn status(&self) -> Vec<(DiscoveryId, Result<DiscoveryDescriptor, RegistryError>)> {
        self.configured
            .iter()
            .map(|id| (id.clone(), self.resolve(id)))
            .collect()
    }
}

/// Operator-facing reason without repeating the identifier.
pub fn warning_reason(error: &RegistryError) -> String {
    match error {
        RegistryError::NotInstalled { reason, .. } => format!("not installed: {reason}"),
        RegistryError::Unknown(_) => "not configured".to_string(),
        other => other.to_string(),
    }
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn newest_version_dir(tool_dir: &Path) -> Result<PathBuf, String> {
    let entries = std::fs::read_dir(tool_dir)
        .map_err(|e| format!("tool directory {} is unreadable: {e}", tool_dir.display()))?;
    entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .max_by(|a, b| compare_versions(a, b))
        .map(|version| tool_dir.join(version))
        .ok_or_else(|| format!("no version installed in {}", tool_dir.display()))
}

fn find_executable(version_dir: &Path, tool: &str) -> Result<PathBuf, String> {
    let is_empty = std::fs::read_dir(version_dir)
        .map(|mut entries| entries.next().is_none())
        .map_err(|e| format!("{} is unreadable: {e}", version_dir.display()))?;
    if is_empty {
        return Err(format!(
            "installation directory {} is empty",
            version_dir.display()
        ));
    }
    let executable = version_dir.join(format!("{tool}{}", std::env::consts::EXE_SUFFIX));
    if !executable.exists() {
        return Err(format!("executable {} not found", executable.display()));
    }
    if !is_runnable(&executable) {
        return Err(format!("{} is not executable", executable.display()));
    }
    Ok(executable)
}

fn resolve_definition(definition: &DiscoveryDefinition) -> Result<DiscoveryDescriptor, String> {
    let words = shell_words::split(&definition.command)
        .map_err(|e| format!("invalid command '{}': {e}", definition.command))?;
    let Some((program, args)) = words.split_first() else {
        return Err("empty command".to_string());
    };
    let executable = resolve_program(program)
        .ok_or_else(|| format!("program '{program}' not found"))?;
    Ok(DiscoveryDescriptor {
        id: definition.id.clone(),
        executable,
        args: args.to_vec(),
        kind: definition
            .kind
            .clone()
            .unwrap_or_else(|| DiscoveryKind::from_tool_name(definition.id.tool())),
    })
}

/// Resolve a program name: paths are checked directly, bare names are
/// searched on `PATH`.
fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        return is_runnable(path).then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_runnable(candidate))
}

fn is_runnable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
