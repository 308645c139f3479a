use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batchops::{
    config::Config,
    database::Database,
    kv::MemoryKvStore,
    repositories::SqliteStore,
    utils::clock::SystemClock,
    Engine,
};

#[derive(Parser)]
#[command(name = "batchops")]
#[command(version)]
#[command(about = "Batch processing engine: cron scheduling, staged report pipeline, incidents")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("batchops={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting BatchOps engine v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    info!("Using database: {}", config.database.url);

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    let repos = SqliteStore::new(database).repos();
    // Queue and schedule state live behind the KvStore trait; this
    // single-process deployment runs them in memory and re-derives
    // schedules from the job table at startup.
    let kv = Arc::new(MemoryKvStore::new());
    let clock = Arc::new(SystemClock);

    let shutdown_grace = config.workers.shutdown_grace();
    let engine = Engine::new(config, repos, kv, clock).await?;
    info!(
        "Callables registered: {}",
        engine.callables.identifiers().join(", ")
    );

    let cancellation_token = CancellationToken::new();
    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received; draining");
            signal_token.cancel();
        }
    });

    let run_token = cancellation_token.clone();
    let engine_for_run = engine.clone();
    let run = tokio::spawn(async move { engine_for_run.run(run_token).await });

    // Wait for the run to drain after cancellation, then force-exit past
    // the grace window.
    tokio::select! {
        result = run => {
            result??;
        }
        _ = async {
            cancellation_token.cancelled().await;
            tokio::time::sleep(shutdown_grace).await;
        } => {
            tracing::warn!("Grace window elapsed; forcing exit");
        }
    }

    info!("BatchOps engine stopped");
    Ok(())
}
