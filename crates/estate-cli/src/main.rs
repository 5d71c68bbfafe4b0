use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use estate_adapters::{normalize, GeneratorConfig, MockListingGenerator};
use estate_storage::{MemoryListingStore, TokioClock};
use estate_sync::{cancel_on_ctrl_c, open_store, IngestConfig, IngestPipeline, IngestRunSummary};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Real estate listing ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once.
    Ingest {
        /// Write into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    /// Run ingests on the configured cron until interrupted.
    Schedule,
    Serve,
    /// Print synthetic listings as JSON.
    Generate {
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn print_summary(summary: &IngestRunSummary) {
    println!(
        "ingest complete: run_id={} sources={} collected={} rejected={} inserted={} updated={} errors={} failed={} reports={}",
        summary.run_id,
        summary.sources.len(),
        summary.collected,
        summary.rejected,
        summary.totals.inserted,
        summary.totals.updated,
        summary.totals.errors,
        summary.failed_sources,
        summary.reports_dir.as_deref().unwrap_or("n/a"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest { dry_run: false }) {
        Commands::Ingest { dry_run: false } => {
            let summary = estate_sync::run_ingest_once_from_env().await?;
            print_summary(&summary);
        }
        Commands::Ingest { dry_run: true } => {
            let pipeline = IngestPipeline::new(
                IngestConfig::from_env(),
                Arc::new(MemoryListingStore::new()),
                Arc::new(TokioClock),
            )?;
            let summary = pipeline.run_once(cancel_on_ctrl_c()).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let store = open_store(&IngestConfig::from_env())?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let mut config = IngestConfig::from_env();
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let store = open_store(&config)?;
            store.migrate().await.context("applying migrations")?;
            let pipeline = Arc::new(IngestPipeline::new(
                config,
                Arc::new(store),
                Arc::new(TokioClock),
            )?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            estate_web::serve_from_env().await?;
        }
        Commands::Generate { count, seed } => {
            let generator = MockListingGenerator::new(GeneratorConfig {
                count,
                seed,
                ..GeneratorConfig::default()
            });
            let now = Utc::now();
            let listings = generator
                .generate(count)
                .iter()
                .map(|record| normalize(generator.config().source.as_str(), record, now))
                .collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
    }

    Ok(())
}
