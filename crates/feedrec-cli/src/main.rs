mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedrec_adapters::FeedKind;
use feedrec_storage::{EntityStore, PgEntityStore};
use feedrec_sync::{build_scheduler, run_sync_once, LogSettings, RunOptions, SyncConfig, SyncError, SyncPipeline};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "feedrec")]
#[command(about = "Reconcile a published CSV feed into Postgres with per-row change tracking")]
struct Cli {
    /// Echo progress to the console in addition to the log file.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true, default_value = "earnings")]
    feed: FeedKind,

    /// Read the feed from a local CSV file instead of downloading it.
    #[arg(long, global = true)]
    input: Option<PathBuf>,

    /// Compare the feed against the stored rows and report the changes without writing them.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed once and reconcile it (default).
    Sync,
    /// Create the feed table if it does not exist.
    Migrate,
    /// Run the sync on the FEEDREC_CRON schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        let category = err.downcast_ref::<SyncError>().map_or("fatal", SyncError::category);
        error!(category, error = %format!("{err:#}"), "feedrec run failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Logging first, so a bad setting below is recorded in the run's log file.
    let log = LogSettings::from_env();
    let log_path = logging::init_logging(&log.log_dir, cli.feed.as_str(), log.log_keep, cli.verbose)?;
    info!(feed = %cli.feed, log = %log_path.display(), "feedrec starting");
    let config = SyncConfig::from_env(cli.feed).map_err(SyncError::from)?;

    let options = RunOptions {
        input: cli.input,
        dry_run: cli.dry_run,
        require_lock: false,
    };

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once(&config, &options).await?;
            println!(
                "sync complete: run_id={} feed={} rows={} duplicates={} inserted={} updated={} unchanged={}",
                summary.run_id,
                summary.feed,
                summary.rows_read,
                summary.duplicates_collapsed,
                summary.inserted,
                summary.updated,
                summary.unchanged
            );
        }
        Commands::Migrate => {
            let layout = config.table_layout()?;
            let store = PgEntityStore::connect(config.require_database()?, layout).await?;
            store.ensure_table().await?;
            println!("table {} ready", store.layout().table());
        }
        Commands::Schedule => {
            let options = RunOptions {
                require_lock: true,
                ..options
            };
            let pipeline = Arc::new(SyncPipeline::from_config(&config, &options).await?);
            let mut sched = build_scheduler(pipeline, &config.cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cron, "scheduler running, ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
