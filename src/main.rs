use anyhow::Result;
use boardwatch::app::App;
use boardwatch::cli::Cli;
use boardwatch::logging;
use clap::Parser;
use tokio::runtime::Runtime;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first so its log_level and log_file can feed the log bridge.
    let app = App::load(cli.config.as_deref())?;
    let level = logging::resolve_level(
        cli.log_level,
        std::env::var("RUST_LOG").ok().as_deref(),
        app.config.log_level.map(|l| l.to_level_filter()),
    );
    logging::init_log_bridge(level, app.config.log_file.as_deref());
    log::info!("Starting boardwatch {}", boardwatch::VERSION);

    let runtime = Runtime::new()?;
    let result = runtime.block_on(app.run(cli.command));

    // Give stray tasks (stderr drains, readers) a bounded time to finish.
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));

    if let Err(ref e) = result {
        eprintln!("boardwatch: error: {e:#}");
    }
    result
}
