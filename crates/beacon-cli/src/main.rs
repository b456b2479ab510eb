use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_digest::{build_scheduler, DigestConfig, DigestJob};
use beacon_storage::PgStore;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "beacon")]
#[command(about = "BidBeacon opportunity digest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the digest once and exit.
    Run {
        /// Search window width in days; defaults to DIGEST_DAYS_BACK.
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the health and manual-trigger endpoints.
    Serve,
    /// Run the digest on DIGEST_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { days_back: None }) {
        Commands::Run { days_back } => {
            let summary = beacon_digest::run_digest_once_from_env(days_back).await?;
            println!(
                "digest complete: run_id={} users={} records={} sent={} dry_run={}",
                summary.run_id,
                summary.users_processed,
                summary.total_records,
                summary.sent_count,
                summary.dry_run
            );
        }
        Commands::Migrate => {
            let config = DigestConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to the database")?;
            let result = store.migrate().await;
            store.close().await;
            result.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => beacon_web::serve_from_env().await?,
        Commands::Schedule => schedule().await?,
    }

    Ok(())
}

async fn schedule() -> Result<()> {
    let config = DigestConfig::from_env();
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    let job = Arc::new(
        DigestJob::from_config(&config, Arc::new(store.clone())).context("building digest job")?,
    );
    let mut sched = build_scheduler(job, &config.cron, config.days_back).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.cron, "digest scheduler started; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    store.close().await;
    Ok(())
}
