use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kidsync_core::SystemClock;
use kidsync_feeds::JsonFileFeed;
use kidsync_storage::PgStore;
use kidsync_sync::{
    maybe_build_scheduler, orchestrator_from_config, recent_reports_markdown, sync_status,
    Collaborators, QuotaLedger, SyncConfig, SyncOrchestrator,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kidsync-cli")]
#[command(about = "Kids events sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full daily sync once.
    Sync,
    /// Reconcile the event feed only.
    SyncEvents {
        /// Read the feed from a local JSON file instead of the remote URL.
        #[arg(long)]
        feed_file: Option<PathBuf>,
    },
    Migrate,
    Serve,
    /// Run the daily sync on `SYNC_CRON` until interrupted.
    Schedule,
    Status {
        /// Also print the newest N run reports.
        #[arg(long, default_value_t = 0)]
        reports: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed command line");

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = kidsync_sync::run_sync_once_from_env().await?;
            let stats = &summary.stats;
            println!(
                "sync complete: run_id={} events={} new={} removed={} competitor_queries={} videos={} comments={} duration={:.1}s",
                summary.run_id,
                stats.event_sync.total,
                stats.event_sync.new,
                stats.event_sync.removed,
                stats.competitor_search.queries_used,
                stats.youtube_videos.videos_found,
                stats.youtube_comments.comments_fetched,
                summary.duration_secs
            );
        }
        Commands::SyncEvents { feed_file } => {
            let config = SyncConfig::load()?;
            let mut collaborators = Collaborators::from_config(&config)?;
            if let Some(path) = feed_file {
                collaborators.feed = Arc::new(JsonFileFeed::new(path));
            }
            let orchestrator =
                SyncOrchestrator::new(connect(&config).await?, Arc::new(SystemClock), collaborators, &config);
            let stats = orchestrator.sync_events_only().await?;
            println!(
                "event sync complete: total={} new={} updated={} removed={} skipped={}",
                stats.total, stats.new, stats.updated, stats.removed, stats.skipped
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::load()?;
            connect(&config).await?.migrate().await.context("applying schema")?;
            println!("schema applied");
        }
        Commands::Serve => {
            kidsync_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let mut config = SyncConfig::load()?;
            config.scheduler_enabled = true;
            let orchestrator = Arc::new(orchestrator_from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, orchestrator).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            println!("daily sync scheduled on `{}`; ctrl-c to stop", config.sync_cron);
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Status { reports } => {
            let config = SyncConfig::load()?;
            let store = connect(&config).await?;
            let clock = Arc::new(SystemClock);
            let ledger = QuotaLedger::new(Arc::clone(&store), clock.clone(), config.refresh.daily_caps);
            let status = sync_status(store.as_ref(), clock.as_ref(), &ledger).await?;
            println!("{}", status.to_text());
            if reports > 0 {
                println!();
                println!("{}", recent_reports_markdown(&config.reports_dir, reports)?);
            }
        }
    }

    Ok(())
}
