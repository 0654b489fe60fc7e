use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use lotsync_sync::RunReport;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lotsync-cli")]
#[command(about = "Listing change-feed sync and normalization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Seed the raw store from the full listing.
    BulkLoad {
        #[arg(long)]
        max_pages: Option<u32>,
        /// Replay upstream responses from a JSON fixture instead of HTTP.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Drain the change feed for one date (default: yesterday).
    Update {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Normalize unprocessed raw records.
    Normalize {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Watermark, table counts and the latest ledger entries.
    Status {
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Fetch one offer and print it as JSON.
    Offer {
        id: String,
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_report<R: RunReport + serde::Serialize>(label: &str, report: &R) -> Result<ExitCode> {
    println!("{label}: {} ({})", report.status(), report.detail());
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(match report.status() {
        lotsync_sync::OperationStatus::Ok => ExitCode::SUCCESS,
        lotsync_sync::OperationStatus::Error => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Update {
        date: None,
        fixture: None,
    });

    match command {
        Commands::Migrate => {
            lotsync_sync::migrate_from_env().await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::BulkLoad { max_pages, fixture } => {
            let report = lotsync_sync::run_bulk_load_from_env(max_pages, fixture.as_deref()).await?;
            print_report("bulk load", &report)
        }
        Commands::Update { date, fixture } => {
            let report = lotsync_sync::run_daily_update_from_env(date, fixture.as_deref()).await?;
            print_report("update", &report)
        }
        Commands::Normalize { limit, batch_size } => {
            let stats = lotsync_sync::run_normalization_from_env(limit, batch_size).await?;
            print_report("normalize", &stats)
        }
        Commands::Status { recent } => {
            let status = lotsync_sync::status_from_env(recent).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            lotsync_sync::run_scheduler_from_env().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Offer { id, fixture } => {
            let offer = lotsync_sync::fetch_offer_from_env(&id, fixture.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&offer)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
