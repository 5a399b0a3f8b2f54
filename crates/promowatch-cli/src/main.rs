use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use promowatch_sync::IngestConfig;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "promowatch-cli")]
#[command(about = "Retail promotion watcher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print its summary.
    Sync {
        #[arg(long)]
        json: bool,
    },
    /// Provision the schema.
    Migrate,
    /// Serve the read API.
    Serve,
    /// Run ingestion on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = promowatch_sync::run_ingest_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync {:?}: run_id={} cursor={} candidates={} novel={} persisted={} skipped={}",
                    summary.status,
                    summary.run_id,
                    summary.cursor.map_or_else(|| "-".to_string(), |c| c.to_string()),
                    summary.candidates,
                    summary.novel,
                    summary.persisted,
                    summary.skipped.total()
                );
            }
            if summary.status.is_failure() {
                bail!("ingest run {} failed: {:?}", summary.run_id, summary.status);
            }
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            let pool = promowatch_storage::connect(&config.database_url).await?;
            promowatch_storage::migrate(&pool).await?;
            pool.close().await;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve => promowatch_web::serve_from_env().await?,
        Commands::Schedule => run_schedule().await?,
    }

    Ok(())
}

async fn run_schedule() -> Result<()> {
    let config = IngestConfig::from_env();
    let pool = promowatch_storage::connect(&config.database_url).await?;
    promowatch_storage::migrate(&pool).await?;
    let pipeline = Arc::new(promowatch_sync::build_pipeline(&config, pool.clone())?);

    let mut scheduler = promowatch_sync::build_scheduler(pipeline, &config.schedule_cron).await?;
    scheduler.start().await.context("starting scheduler")?;
    info!(cron = %config.schedule_cron, "ingest scheduler running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    scheduler.shutdown().await.context("stopping scheduler")?;
    pool.close().await;
    Ok(())
}
