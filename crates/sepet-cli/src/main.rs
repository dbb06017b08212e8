use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use sepet_storage::{ArchiveUploader, Unpacker};
use sepet_sync::{
    consolidator_from_config, load_shops, maybe_build_scheduler, supervisor_from_config,
    worker_runner_from_config, ProcessLauncher, SyncConfig, WorkerJob,
};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "sepet")]
#[command(about = "Sepet grocery price tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled shop once, then merge and archive the day's snapshot.
    Run {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run daily on SEPET_SYNC_CRON until interrupted.
    Schedule,
    /// Crawl one catalog chunk of one shop and print the report as JSON.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        shop: String,
        #[arg(long)]
        chunk: usize,
        #[arg(long)]
        chunks: usize,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Rebuild a shop's combined.csv from its category files.
    Consolidate {
        #[arg(long)]
        shop: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Merge a shop's combined.csv into the day's snapshot store.
    Merge {
        #[arg(long)]
        shop: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Compress the day's snapshot store.
    Archive {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Reduce a directory to its newest archive and extracted store.
    Unpack {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Upload an archive to SEPET_UPLOAD_URL.
    Deposit { archive: PathBuf },
    /// Serve the authenticated deposit endpoint.
    Serve,
}

impl Commands {
    fn log_prefix(&self) -> &'static str {
        match self {
            Commands::Worker { .. } => "sepet-worker.log",
            Commands::Serve => "sepet-web.log",
            _ => "sepet.log",
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run { date: None });
    let _guard = logging::init(Path::new(logging::LOG_DIR), command.log_prefix())?;
    let config = SyncConfig::from_env();

    match command {
        Commands::Run { date } => {
            let launcher = Arc::new(ProcessLauncher::current_exe()?);
            let supervisor = supervisor_from_config(&config, launcher).await?;
            let summary = supervisor.run_once(date.unwrap_or_else(today)).await?;
            let completed = summary
                .shops
                .iter()
                .filter(|shop| shop.status == sepet_sync::ShopStatus::Completed)
                .count();
            println!(
                "run complete: run_id={} date={} shops={}/{} archive={} reports={}",
                summary.run_id,
                summary.date,
                completed,
                summary.shops.len(),
                summary
                    .archive
                    .as_ref()
                    .map(|a| a.archive_path.display().to_string())
                    .unwrap_or_else(|| "-".into()),
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("set SEPET_SCHEDULER_ENABLED=true to run on a schedule");
            }
            let launcher = Arc::new(ProcessLauncher::current_exe()?);
            let supervisor = Arc::new(supervisor_from_config(&config, launcher).await?);
            let Some(mut scheduler) = maybe_build_scheduler(&config, supervisor).await? else {
                bail!("scheduler was not built");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Worker {
            shop,
            chunk,
            chunks,
            date,
        } => {
            let runner = worker_runner_from_config(&config).await?;
            let report = runner
                .run(&WorkerJob {
                    shop_name: shop,
                    chunk_index: chunk,
                    chunk_count: chunks,
                    date,
                })
                .await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Commands::Consolidate { shop, date } => {
            let consolidator = consolidator_from_config(&config).await;
            let outcome = consolidator.consolidate(&shop, date.unwrap_or_else(today)).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Merge { shop, date } => {
            let date = date.unwrap_or_else(today);
            let shops = load_shops(&config.shops_path()).await?;
            let Some(shop) = shops.iter().find(|s| s.shop_name == shop) else {
                bail!("unknown shop {shop:?}");
            };
            let records = config.file_store().read_combined(&shop.shop_name, date).await?;
            let snapshots = config.snapshot_store();
            snapshots.prepare_day(date).await?;
            let outcome = snapshots.merge_shop(date, &shop.table_name(), &records).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Archive { date } => {
            let outcome = config.archive_manager().archive(date.unwrap_or_else(today)).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Unpack { dir } => {
            let dir = dir.unwrap_or_else(|| {
                std::env::var("SEPET_WATCH_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| config.db_dir.clone())
            });
            let report = Unpacker::new(dir).unpack().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Deposit { archive } => {
            let (Some(url), Some(secret)) = (&config.upload_url, &config.upload_secret) else {
                bail!("SEPET_UPLOAD_URL and SEPET_UPLOAD_SECRET must both be set");
            };
            let status = ArchiveUploader::new(url, secret)?.upload(&archive).await?;
            println!("deposited {} ({status})", archive.display());
        }
        Commands::Serve => sepet_web::serve_from_env().await?,
    }

    Ok(())
}
