use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mdp_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mdp")]
#[command(about = "Miami deal pipeline: collect listings, track prices, serve the dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and exit.
    Sync,
    /// Serve the dataset over HTTP.
    Serve,
    /// Run the pipeline on the MDP_SYNC_CRON schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mdp_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = mdp_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} areas={} failed={} candidates={} new={} price_updates={} total={} dataset={}",
                summary.run_id,
                summary.areas,
                summary.failed_areas.len(),
                summary.raw_candidates,
                summary.new_deals,
                summary.price_updates,
                summary.total_deals,
                summary.dataset_path
            );
            for address in summary.updated_addresses.iter().take(5) {
                println!("  price changed: {address}");
            }
        }
        Commands::Serve => {
            mdp_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
            mdp_sync::run_scheduled(Arc::new(pipeline)).await?;
        }
    }

    Ok(())
}
