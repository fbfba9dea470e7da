//! Shared integration test helpers for boardwatch.
//!
//! Builds throwaway install trees containing small `/bin/sh` discovery tools
//! that speak the line protocol, plus managers with short timeouts.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{FakeDiscovery, TestInstall};
//! ```
//!
//! The `#[allow(dead_code)]` attribute suppresses warnings when only a
//! subset of helpers is used per file.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use boardwatch::discovery::{
    DiscoveryId, DiscoveryManager, DiscoveryRegistry, ListStrategy, ManagerOptions,
    SessionOptions,
};
use tempfile::TempDir;

/// JSON object for a serial port as a discovery tool reports it.
pub fn serial_port(address: &str) -> String {
    format!(
        r#"{{"address":"{address}","label":"{address}","protocol":"serial","protocolLabel":"Serial Port (USB)","properties":{{"pid":"0x0043","vid":"0x2341"}},"hardwareId":"HW{address}"}}"#
    )
}

/// JSON object for a network port.
pub fn network_port(address: &str) -> String {
    format!(
        r#"{{"address":"{address}","label":"board at {address}","protocol":"network","protocolLabel":"Network Port","properties":{{"board":"uno-r4"}}}}"#
    )
}

/// Behaviour of a fake discovery tool.
#[derive(Debug, Clone)]
pub struct FakeDiscovery {
    /// Ports announced after `START_SYNC` and returned by `LIST`.
    pub ports: Vec<String>,
    /// Raw lines emitted after the `add` events (removals, garbage...).
    pub extra_lines: Vec<String>,
    /// Shell snippet run after the sync events (e.g. `sleep 1; exit 3`).
    pub after_sync: Option<String>,
    /// Reply line for `HELLO`.
    pub hello_reply: String,
    /// Never answer `HELLO`.
    pub silent: bool,
    /// On `QUIT`, block forever instead of exiting.
    pub ignore_quit: bool,
    /// On `STOP`, block forever instead of replying.
    pub hang_on_stop: bool,
    /// Write the tool's pid here on startup.
    pub pidfile: Option<PathBuf>,
}

impl Default for FakeDiscovery {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            extra_lines: Vec::new(),
            after_sync: None,
            hello_reply: r#"{"eventType":"hello","message":"OK","protocolVersion":1}"#.to_string(),
            silent: false,
            ignore_quit: false,
            hang_on_stop: false,
            pidfile: None,
        }
    }
}

impl FakeDiscovery {
    pub fn with_ports(ports: Vec<String>) -> Self {
        Self {
            ports,
            ..Self::default()
        }
    }

    /// The `/bin/sh` source of the tool.
    pub fn script(&self) -> String {
        let mut s = String::from("#!/bin/sh\n");
        if let Some(pidfile) = &self.pidfile {
            s.push_str(&format!("echo $$ > '{}'\n", pidfile.display()));
        }
        if self.silent {
            s.push_str("exec sleep 30\n");
            return s;
        }
        s.push_str("while IFS= read -r line; do\n  case \"$line\" in\n");
        s.push_str(&format!("    HELLO*) echo '{}' ;;\n", self.hello_reply));

        s.push_str("    START_SYNC)\n      echo '{\"eventType\":\"start_sync\",\"message\":\"OK\"}'\n");
        for port in &self.ports {
            s.push_str(&format!("      echo '{{\"eventType\":\"add\",\"port\":{port}}}'\n"));
        }
        for line in &self.extra_lines {
            s.push_str(&format!("      echo '{line}'\n"));
        }
        if let Some(after) = &self.after_sync {
            s.push_str(&format!("      {after}\n"));
        }
        s.push_str("      ;;\n");

        s.push_str("    START) echo '{\"eventType\":\"start\",\"message\":\"OK\"}' ;;\n");
        s.push_str(&format!(
            "    LIST) echo '{{\"eventType\":\"list\",\"ports\":[{}]}}' ;;\n",
            self.ports.join(",")
        ));
        if self.hang_on_stop {
            s.push_str("    STOP) exec sleep 30 ;;\n");
        } else {
            s.push_str("    STOP) echo '{\"eventType\":\"stop\",\"message\":\"OK\"}' ;;\n");
        }
        if self.ignore_quit {
            s.push_str("    QUIT) exec sleep 30 ;;\n");
        } else {
            s.push_str("    QUIT) echo '{\"eventType\":\"quit\",\"message\":\"OK\"}'; exit 0 ;;\n");
        }
        s.push_str(
            "    *) echo '{\"eventType\":\"command_error\",\"error\":true,\"message\":\"unknown command\"}' ;;\n",
        );
        s.push_str("  esac\ndone\n");
        s
    }
}

/// Temporary install root with helpers to place discovery tools in it.
pub struct TestInstall {
    pub dir: TempDir,
}

impl TestInstall {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Version directory of `vendor:tool` at `version`.
    pub fn version_dir(&self, id: &str, version: &str) -> PathBuf {
        let id = DiscoveryId::parse(id).expect("valid id");
        self.root()
            .join("packages")
            .join(id.vendor())
            .join("tools")
            .join(id.tool())
            .join(version)
    }

    /// Install a fake tool as `<root>/packages/<vendor>/tools/<tool>/<version>/<tool>`.
    pub fn install(&self, id: &str, version: &str, fake: &FakeDiscovery) -> PathBuf {
        let dir = self.version_dir(id, version);
        fs::create_dir_all(&dir).expect("Failed to create version dir");
        let tool = DiscoveryId::parse(id).expect("valid id").tool().to_string();
        let exe = dir.join(tool);
        fs::write(&exe, fake.script()).expect("Failed to write fake discovery");
        make_executable(&exe);
        exe
    }

    /// Create an empty version directory (an interrupted installation).
    pub fn install_empty(&self, id: &str, version: &str) {
        fs::create_dir_all(self.version_dir(id, version)).expect("Failed to create version dir");
    }

    /// Path for a pid file inside the temp dir.
    pub fn pidfile(&self, name: &str) -> PathBuf {
        self.root().join(format!("{name}.pid"))
    }

    pub fn registry(&self, ids: &[&str]) -> DiscoveryRegistry {
        let ids = ids
            .iter()
            .map(|id| DiscoveryId::parse(id).expect("valid id"))
            .collect();
        DiscoveryRegistry::new(self.root(), ids)
    }

    pub fn manager(&self, ids: &[&str]) -> DiscoveryManager {
        DiscoveryManager::new(self.registry(ids), fast_options())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod fake discovery");
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

/// Manager options with timeouts short enough for tests.
pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        session: SessionOptions {
            handshake_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(3),
            quit_grace: Duration::from_millis(500),
            ..SessionOptions::default()
        },
        settle_quiet: Duration::from_millis(300),
        list_timeout: Duration::from_secs(5),
        strategy: ListStrategy::Sync,
    }
}

/// Read a pid written by a fake discovery, waiting briefly for it to appear.
pub fn read_pid(path: &Path) -> u32 {
    for _ in 0..50 {
        if let Ok(content) = fs::read_to_string(path)
            && let Ok(pid) = content.trim().parse()
        {
            return pid;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("pid file {} never written", path.display());
}

/// Whether a process with `pid` still exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
