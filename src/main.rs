//! Nezuko core — process entry point.
//!
//! Loads configuration, wires the Persistence Gateway/cache/token cipher,
//! and runs the Bot Supervisor until Ctrl+C, following the same
//! spawn → `ctrl_c()` → bounded-timeout-join shutdown sequence the teacher
//! uses for its gateway command.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nezuko_core::cache::{MembershipCache, NullCache, RedisCache};
use nezuko_core::config::Config;
use nezuko_core::{BotSupervisor, PersistenceGateway, TokenCipher};

#[derive(Parser)]
#[command(name = "nezuko-core")]
#[command(about = "Core enforcement engine for channel-subscription-gated Telegram groups")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot supervisor (default if no subcommand is given)
    Run,
    /// Connect to the database, bootstrap the schema if needed, and exit
    Migrate,
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("nezuko-core {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Commands::Migrate) => {
            let config = Config::load().context("failed to load configuration")?;
            init_tracing(&config);
            PersistenceGateway::connect(&config.database_url, config.expected_bots)
                .await
                .context("failed to connect and bootstrap schema")?;
            info!("schema bootstrap complete");
            Ok(())
        }
        Some(Commands::Run) | None => run().await,
    }
}

async fn run() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config);

    let db = Arc::new(
        PersistenceGateway::connect(&config.database_url, config.expected_bots)
            .await
            .context("failed to connect to the database")?,
    );
    let cipher = Arc::new(TokenCipher::new(&config.encryption_key));
    let cache: Arc<dyn MembershipCache> = match &config.cache_url {
        Some(url) => Arc::new(
            RedisCache::connect(url)
                .await
                .context("failed to connect to the cache backend")?,
        ),
        None => Arc::new(NullCache),
    };

    let shutdown_grace = config.shutdown_grace;
    let supervisor = Arc::new(BotSupervisor::new(db, cipher, cache, config));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let supervisor_for_task = supervisor.clone();
    let supervisor_handle = tokio::spawn(async move { supervisor_for_task.run(shutdown_rx).await });

    info!("nezuko-core running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutdown signal received, stopping bot workers");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(shutdown_grace, supervisor_handle).await {
        Ok(Ok(Ok(()))) => info!("supervisor stopped cleanly"),
        Ok(Ok(Err(err))) => error!(error = %err, "supervisor exited with an error"),
        Ok(Err(join_err)) => error!(error = %join_err, "supervisor task panicked"),
        Err(_) => error!("supervisor did not stop within the shutdown grace period"),
    }

    Ok(())
}

/// Initializes structured logging. `RUST_LOG` overrides the configured level
/// when present, matching the env-var-first convention the rest of this
/// process's configuration follows.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();
}
