#![cfg(unix)]

mod common;

use std::fs;
use std::path::Path;

use boardwatch::app::{self, App};
use boardwatch::output::OutputFormat;
use common::{FakeDiscovery, TestInstall, network_port, serial_port};

const SERIAL: &str = "builtin:serial-discovery";
const MDNS: &str = "builtin:mdns-discovery";

fn write_config(dir: &Path, data_dir: &Path) -> std::path::PathBuf {
    let path = dir.join("config.yaml");
    let yaml = format!(
        "data_dir: '{}'\n\
         discoveries:\n  - {SERIAL}\n  - {MDNS}\n\
         handshake_timeout_ms: 3000\n\
         command_timeout_ms: 3000\n\
         settle_quiet_ms: 300\n\
         list_timeout_ms: 5000\n\
         quit_grace_ms: 500\n",
        data_dir.display()
    );
    fs::write(&path, yaml).unwrap();
    path
}

async fn run_list(app: &App, format: OutputFormat) -> (String, String) {
    let manager = app.build_manager().unwrap();
    let mut out = Vec::new();
    let mut err = Vec::new();
    app::list(&manager, format, &mut out, &mut err).await.unwrap();
    manager.shutdown().await;
    (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
}

#[tokio::test]
async fn test_list_json_with_missing_discovery() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![serial_port("/dev/ttyACM0")]),
    );
    let config_dir = tempfile::tempdir().unwrap();
    let app = App::load(Some(write_config(config_dir.path(), install.root()).as_path())).unwrap();

    let (out, err) = run_list(&app, OutputFormat::Json).await;
    let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
    let entries = parsed.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let port = &entries[0]["port"];
    assert_eq!(port["address"], "/dev/ttyACM0");
    assert_eq!(port["protocol"], "serial");
    assert_eq!(port["protocol_label"], "Serial Port (USB)");
    assert_eq!(port["properties"]["vid"], "0x2341");

    assert!(
        err.starts_with(&format!("Error starting discovery {MDNS}: ")),
        "stderr: {err}"
    );
}

#[tokio::test]
async fn test_list_text_without_ports() {
    let install = TestInstall::new();
    install.install(SERIAL, "1.4.1", &FakeDiscovery::default());
    install.install(MDNS, "1.0.9", &FakeDiscovery::default());
    let config_dir = tempfile::tempdir().unwrap();
    let app = App::load(Some(write_config(config_dir.path(), install.root()).as_path())).unwrap();

    let (out, err) = run_list(&app, OutputFormat::Text).await;
    assert_eq!(out, "No boards found.\n");
    assert!(err.is_empty());
}

#[tokio::test]
async fn test_custom_definition_is_listed() {
    let install = TestInstall::new();
    install.install(SERIAL, "1.4.1", &FakeDiscovery::default());
    install.install(MDNS, "1.0.9", &FakeDiscovery::default());
    let config_dir = tempfile::tempdir().unwrap();
    let config_path = write_config(config_dir.path(), install.root());

    let script = config_dir.path().join("net-discovery.sh");
    fs::write(
        &script,
        FakeDiscovery::with_ports(vec![network_port("10.1.2.3")]).script(),
    )
    .unwrap();
    let definitions = config_dir.path().join("discoveries");
    fs::create_dir_all(&definitions).unwrap();
    fs::write(
        definitions.join("net.toml"),
        format!(
            "id = \"acme:net-discovery\"\ncommand = \"/bin/sh '{}'\"\n",
            script.display()
        ),
    )
    .unwrap();

    let app = App::load(Some(config_path.as_path())).unwrap();
    let (out, err) = run_list(&app, OutputFormat::Text).await;
    assert!(out.contains("10.1.2.3"), "stdout: {out}");
    assert!(out.contains("Network Port"), "stdout: {out}");
    assert!(err.is_empty(), "stderr: {err}");
}

#[test]
fn test_invalid_config_is_reported() {
    let config_dir = tempfile::tempdir().unwrap();
    let path = config_dir.path().join("config.yaml");
    fs::write(&path, "list_timeout_ms: 0\n").unwrap();
    let err = App::load(Some(path.as_path())).unwrap_err();
    assert!(format!("{err:#}").contains("list_timeout_ms"));
}
