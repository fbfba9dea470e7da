//! Log bridge for the boardwatch binary.
//!
//! Routes every `log::info!()` etc. from all crates to stderr as
//! `[timestamp LEVEL target] message` lines and, when a log file is
//! configured, appends the same lines there.
//!
//! Level precedence: `--log-level` flag, then `RUST_LOG`, then the config's
//! `log_level`, then `warn`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

/// Pick the effective level.
pub fn resolve_level(
    flag: Option<LevelFilter>,
    env: Option<&str>,
    config: Option<LevelFilter>,
) -> LevelFilter {
    flag.or_else(|| env.and_then(|value| LevelFilter::from_str(value.trim()).ok()))
        .or(config)
        .unwrap_or(LevelFilter::Warn)
}

struct BridgeLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

fn format_record(record: &Record) -> String {
    format!(
        "[{} {} {}] {}\n",
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
        level_str(record.level()),
        record.target(),
        record.args()
    )
}

impl Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        let _ = std::io::stderr().write_all(line.as_bytes());
        if let Some(file) = &self.file {
            let mut file = file.lock();
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
    }
}

/// Install the bridge as the global logger.
///
/// A log file that cannot be opened is reported on stderr and skipped.
/// Calling this twice keeps the first logger.
pub fn init_log_bridge(level: LevelFilter, log_file: Option<&Path>) {
    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(Mutex::new(file)),
            Err(e) => {
                eprintln!("boardwatch: cannot open log file {}: {e}", path.display());
                None
            }
        }
    });

    let logger = Box::new(BridgeLogger { level, file });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
