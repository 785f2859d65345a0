// pgload binary
//
// Design Decision: The DSN is the only command line input; every other tunable
// keeps its fixed default so runs are comparable.
// Design Decision: SIGINT / SIGTERM handlers are installed before the run starts
// and fire the generator's shutdown handle, so a signal during setup still
// reaches teardown.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pgload::config::{DEFAULT_DSN, DSN_ENV};
use pgload::gateway::PostgresGateway;
use pgload::shutdown::SignalWatcher;
use pgload::telemetry::{init_logging, LogConfig};
use pgload::{LoadConfig, LoadGenerator};

#[derive(Parser)]
#[command(name = "pgload")]
#[command(about = "Generate idle, idle-in-transaction and active load against PostgreSQL")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(env = DSN_ENV, default_value = DEFAULT_DSN)]
    dsn: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging(LogConfig::from_env());

    let cli = Cli::parse();
    let config = LoadConfig::new(cli.dsn);
    let gateway = PostgresGateway::new(&config.dsn).context("Invalid connection string")?;

    let generator = LoadGenerator::new(Arc::new(gateway), config);
    let stop = generator.shutdown_handle();
    let signals = SignalWatcher::install().context("Could not install signal handlers")?;
    tokio::spawn(async move {
        match signals.recv().await {
            Ok(signal) => {
                eprintln!("\n[pgload] stopping…");
                tracing::info!(signal, "Received shutdown signal");
                stop.trigger();
            }
            Err(e) => tracing::error!(error = %e, "Signal handler failed"),
        }
    });

    let summary = generator
        .run(std::future::pending())
        .await
        .context("Load generator failed")?;

    tracing::debug!(summary = %serde_json::to_string(&summary)?, "Run summary");
    Ok(())
}
