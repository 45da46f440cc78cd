use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use jobmarket_core::ScrapeRunLog;
use jobmarket_storage::JobStore;
use jobmarket_sync::{build_scheduler, export_dataset, load_reported_runs, ScrapeConfig, ScrapeService};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobmarket")]
#[command(about = "Job portal scrape pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape listing pages into the job store.
    Scrape {
        #[arg(long)]
        max_pages: Option<u32>,
        /// Re-process a directory of archived pages instead of fetching.
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Serve the read-only JSON query surface.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write the cleaned dataset as Parquet.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
        /// Only postings scraped on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,
    },
    /// List recent runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        /// Read run reports from disk instead of the store.
        #[arg(long)]
        reports: bool,
    },
    /// Run scrapes on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolving working directory")?;
    let config = ScrapeConfig::from_env(&root).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Scrape {
        max_pages: None,
        replay: None,
    }) {
        Commands::Scrape { max_pages, replay } => {
            let (stop_tx, stop_rx) = watch::channel(false);
            stop_on_ctrl_c(stop_tx);
            let service = ScrapeService::from_config(config).await?.with_stop_signal(stop_rx);
            let log = match replay {
                Some(dir) => service.replay(&dir, max_pages).await?.log,
                None => {
                    let pages = max_pages.unwrap_or(service.config().max_pages);
                    let rate_limit = service.config().rate_limit.to_rate_limit_config();
                    service.run_scrape(pages, rate_limit).await?
                }
            };
            println!("scrape complete: {}", summary_line(&log));
        }
        Commands::Serve { port } => {
            let store = connect(&config).await?;
            let port = port.unwrap_or(config.web_port);
            jobmarket_web::serve(store, port, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Commands::Export { out, since } => {
            let store = connect(&config).await?;
            let out = out.unwrap_or_else(|| config.reports_dir.join("export"));
            let manifest = export_dataset(&store, &out, since).await?;
            println!(
                "export complete: postings={} skill_rows={} dir={}",
                manifest.postings,
                manifest.skill_rows,
                out.display()
            );
        }
        Commands::Runs { limit, reports } => {
            let runs = if reports {
                load_reported_runs(&config.reports_dir, limit as usize)?
            } else {
                connect(&config).await?.recent_runs(limit).await?
            };
            if runs.is_empty() {
                println!("no runs recorded");
            }
            for log in &runs {
                println!("{}", summary_line(log));
            }
        }
        Commands::Schedule => {
            let (stop_tx, stop_rx) = watch::channel(false);
            let service = Arc::new(ScrapeService::from_config(config).await?.with_stop_signal(stop_rx));
            let Some(mut sched) = build_scheduler(Arc::clone(&service)).await? else {
                bail!("scheduling is disabled; set schedule.enabled or JOBMARKET_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            stop_tx.send_replace(true);
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn connect(config: &ScrapeConfig) -> Result<JobStore> {
    JobStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening job store {}", config.database_url))
}

fn stop_on_ctrl_c(stop: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current page");
            stop.send_replace(true);
        }
    });
}

fn summary_line(log: &ScrapeRunLog) -> String {
    format!(
        "run_id={} status={} started={} pages={}/{} failed={} inserted={} updated={} skipped={} errors={}",
        log.run_id,
        log.status,
        log.started_at.to_rfc3339(),
        log.pages_succeeded,
        log.pages_requested,
        log.pages_failed,
        log.records_inserted,
        log.records_updated,
        log.records_skipped(),
        log.error_count
    )
}
