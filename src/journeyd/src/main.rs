//! journeyd: connects the journey stores and runs the scheduler sweeper.

use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use journey_core::config::AppConfig;
use journey_engine::{JourneyEngine, MessageSender};
use journey_scheduler::Sweeper;
use journey_store::{PgStore, Stores};

#[derive(Parser, Debug)]
#[command(name = "journeyd")]
#[command(about = "Scheduler daemon for chat journeys")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "JOURNEY_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// PostgreSQL connection URL (overrides config)
    #[arg(long, env = "JOURNEY_ENGINE__DATABASE__URL")]
    database_url: Option<String>,

    /// Seconds between sweeps (overrides config)
    #[arg(long, env = "JOURNEY_ENGINE__SCHEDULER__TICK_INTERVAL_SECS")]
    tick_interval_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Apply database migrations and exit
    Migrate,
    /// Run the sweeper until Ctrl-C
    Sweep,
    /// Run a single sweep and inactivity pass, then print the reports
    SweepOnce,
}

/// Logs outbound messages instead of delivering them. The embedding service
/// supplies the real transport.
struct LogSender {
    node_id: String,
}

#[async_trait]
impl MessageSender for LogSender {
    async fn send(&self, tenant_id: Uuid, conversation_id: i64, text: &str) -> anyhow::Result<()> {
        info!(
            node_id = %self.node_id,
            tenant_id = %tenant_id,
            conversation_id,
            chars = text.chars().count(),
            "Outbound message"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "journeyd=info,journey_engine=info,journey_scheduler=info,journey_store=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(secs) = cli.tick_interval_secs {
        config.scheduler.tick_interval_secs = secs;
    }

    info!(
        node_id = %config.node_id,
        command = ?cli.command,
        tick_interval_secs = config.scheduler.tick_interval_secs,
        batch_size = config.scheduler.batch_size,
        "Configuration loaded"
    );

    let store = Arc::new(PgStore::connect(&config.database).await?);
    if cli.command == Command::Migrate {
        store.migrate().await?;
        info!("Migrations applied");
        return Ok(());
    }
    if config.database.run_migrations {
        store.migrate().await?;
    }

    let sender = Arc::new(LogSender {
        node_id: config.node_id.clone(),
    });
    let engine = JourneyEngine::new(Stores::from_backend(store), sender, config.engine.clone());
    let sweeper = Arc::new(Sweeper::new(engine, config.scheduler.clone()));

    match cli.command {
        Command::Migrate => Ok(()),
        Command::SweepOnce => {
            let tick = sweeper.tick().await;
            let inactivity = sweeper.sweep_inactive().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "node_id": config.node_id,
                    "tick": tick,
                    "inactivity": inactivity,
                }))?
            );
            Ok(())
        }
        Command::Sweep => {
            if !config.scheduler.enabled {
                warn!("Scheduler disabled by configuration, exiting");
                return Ok(());
            }
            let handle = sweeper.start()?;
            info!(node_id = %config.node_id, "journeyd is sweeping");

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            sweeper.shutdown().await;
            handle.await?;
            Ok(())
        }
    }
}
