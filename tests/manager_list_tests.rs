#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use boardwatch::discovery::{
    BoardCatalog, BoardHint, DiscoveryManager, ListStrategy, ManagerOptions, SessionState,
};
use common::{FakeDiscovery, TestInstall, fast_options, network_port, serial_port};

const SERIAL: &str = "builtin:serial-discovery";
const MDNS: &str = "builtin:mdns-discovery";

#[tokio::test]
async fn test_two_ports_and_missing_executable() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![
            serial_port("/dev/ttyACM0"),
            serial_port("/dev/ttyACM1"),
        ]),
    );
    install.install_empty(MDNS, "1.0.9");
    let manager = install.manager(&[SERIAL, MDNS]);

    let result = manager.list_ports().await.unwrap();
    assert_eq!(result.ports.addresses(), vec!["/dev/ttyACM0", "/dev/ttyACM1"]);
    for port in &result.ports {
        assert!(!port.protocol.is_empty());
        assert!(!port.protocol_label.is_empty());
    }
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].discovery.to_string(), MDNS);
    assert!(result.warnings[0].to_string().contains(MDNS));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_repeated_listing_is_identical() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![
            serial_port("/dev/ttyACM1"),
            serial_port("/dev/ttyACM0"),
        ]),
    );
    install.install(
        MDNS,
        "1.0.9",
        &FakeDiscovery::with_ports(vec![network_port("192.168.1.7"), network_port("192.168.1.3")]),
    );
    let manager = install.manager(&[SERIAL, MDNS]);

    let first = manager.list_ports().await.unwrap();
    let second = manager.list_ports().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.ports.addresses(),
        vec!["/dev/ttyACM1", "/dev/ttyACM0", "192.168.1.7", "192.168.1.3"]
    );
    assert!(first.warnings.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sessions_are_reused_between_listings() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![serial_port("/dev/ttyACM0")]),
    );
    let manager = install.manager(&[SERIAL]);

    manager.list_ports().await.unwrap();
    let pids = manager.session_pids().await;
    assert_eq!(pids.len(), 1);
    let states = manager.session_states().await;
    assert_eq!(states[0].1, SessionState::Idle);

    manager.list_ports().await.unwrap();
    assert_eq!(manager.session_pids().await, pids);

    manager.shutdown().await;
    assert!(manager.session_pids().await.is_empty());
}

#[tokio::test]
async fn test_updates_are_deduplicated() {
    let install = TestInstall::new();
    let updated = serial_port("/dev/ttyACM0").replace("Serial Port (USB)", "Serial Port (ACM)");
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![
            serial_port("/dev/ttyACM0"),
            serial_port("/dev/ttyACM1"),
            updated,
        ]),
    );
    let manager = install.manager(&[SERIAL]);

    let result = manager.list_ports().await.unwrap();
    assert_eq!(result.ports.addresses(), vec!["/dev/ttyACM0", "/dev/ttyACM1"]);
    assert_eq!(result.ports.as_slice()[0].protocol_label, "Serial Port (ACM)");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_removed_port_is_not_listed() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery {
            extra_lines: vec![
                r#"{"eventType":"remove","port":{"address":"/dev/ttyACM0","protocol":"serial"}}"#
                    .to_string(),
            ],
            ..FakeDiscovery::with_ports(vec![
                serial_port("/dev/ttyACM0"),
                serial_port("/dev/ttyACM1"),
            ])
        },
    );
    let manager = install.manager(&[SERIAL]);

    let result = manager.list_ports().await.unwrap();
    assert_eq!(result.ports.addresses(), vec!["/dev/ttyACM1"]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_reported_error_drops_only_that_discovery() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery {
            extra_lines: vec![r#"{"eventType":"error","message":"usb bus reset"}"#.to_string()],
            ..FakeDiscovery::with_ports(vec![serial_port("/dev/ttyACM0")])
        },
    );
    install.install(
        MDNS,
        "1.0.9",
        &FakeDiscovery::with_ports(vec![network_port("10.0.0.5")]),
    );
    let manager = install.manager(&[SERIAL, MDNS]);

    let result = manager.list_ports().await.unwrap();
    assert_eq!(result.ports.addresses(), vec!["10.0.0.5"]);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].discovery.to_string(), SERIAL);
    assert_eq!(result.warnings[0].reason, "usb bus reset");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_handshake_failure_is_a_warning() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery {
            hello_reply: r#"{"eventType":"hello","error":true,"message":"no permission"}"#
                .to_string(),
            ..FakeDiscovery::default()
        },
    );
    install.install(
        MDNS,
        "1.0.9",
        &FakeDiscovery::with_ports(vec![network_port("10.0.0.5")]),
    );
    let manager = install.manager(&[SERIAL, MDNS]);

    let result = manager.list_ports().await.unwrap();
    assert_eq!(result.ports.addresses(), vec!["10.0.0.5"]);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].reason.contains("no permission"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_malformed_output_marks_discovery_unhealthy() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery {
            extra_lines: vec![
                "not json".to_string(),
                "{broken".to_string(),
                "still not json".to_string(),
            ],
            ..FakeDiscovery::with_ports(vec![serial_port("/dev/ttyACM0")])
        },
    );
    let manager = install.manager(&[SERIAL]);

    let result = manager.list_ports().await.unwrap();
    assert!(result.ports.is_empty());
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].reason.contains("unhealthy"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_crashed_session_is_recreated() {
    let install = TestInstall::new();
    let marker = install.root().join("crashed-once");
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery {
            after_sync: Some(format!(
                "if [ ! -f '{0}' ]; then touch '{0}'; exit 1; fi",
                marker.display()
            )),
            ..FakeDiscovery::with_ports(vec![serial_port("/dev/ttyACM0")])
        },
    );
    let manager = install.manager(&[SERIAL]);

    let first = manager.list_ports().await.unwrap();
    assert!(first.ports.is_empty());
    assert_eq!(first.warnings.len(), 1);
    assert!(first.warnings[0].reason.contains("exited"));

    let second = manager.list_ports().await.unwrap();
    assert_eq!(second.ports.addresses(), vec!["/dev/ttyACM0"]);
    assert!(second.warnings.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_poll_strategy() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![
            serial_port("/dev/ttyACM0"),
            serial_port("/dev/ttyACM1"),
        ]),
    );
    let options = ManagerOptions {
        strategy: ListStrategy::Poll,
        ..fast_options()
    };
    let manager = DiscoveryManager::new(install.registry(&[SERIAL]), options);

    let result = manager.list_ports().await.unwrap();
    assert_eq!(result.ports.addresses(), vec!["/dev/ttyACM0", "/dev/ttyACM1"]);
    assert!(result.warnings.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_poll_keeps_valid_ports_next_to_invalid_one() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![
            serial_port("/dev/ttyACM0"),
            r#"{"address":"/dev/ttyS9","protocol":""}"#.to_string(),
        ]),
    );
    let options = ManagerOptions {
        strategy: ListStrategy::Poll,
        ..fast_options()
    };
    let manager = DiscoveryManager::new(install.registry(&[SERIAL]), options);

    let started = Instant::now();
    let result = manager.list_ports().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.ports.addresses(), vec!["/dev/ttyACM0"]);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);

    // The session survived and is reused.
    let states = manager.session_states().await;
    assert_eq!(states[0].1, SessionState::Idle);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_board_hints_are_applied() {
    let install = TestInstall::new();
    install.install(
        SERIAL,
        "1.4.1",
        &FakeDiscovery::with_ports(vec![serial_port("/dev/ttyACM0")]),
    );
    let catalog = BoardCatalog::new(vec![BoardHint {
        name: "Arduino Uno".to_string(),
        fqbn: "arduino:avr:uno".to_string(),
        properties: [
            ("vid".to_string(), "0x2341".to_string()),
            ("pid".to_string(), "0x0043".to_string()),
        ]
        .into(),
    }]);
    let manager =
        DiscoveryManager::new(install.registry(&[SERIAL]), fast_options()).with_board_catalog(catalog);

    let result = manager.list_ports().await.unwrap();
    let boards = &result.ports.as_slice()[0].boards;
    assert_eq!(boards.len(), 1);
    assert_eq!(boards[0].fqbn, "arduino:avr:uno");

    manager.shutdown().await;
}
