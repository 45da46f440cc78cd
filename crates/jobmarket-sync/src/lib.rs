//! Scrape orchestration: configuration, rule tables, normalization, the page
//! pipeline and everything a run leaves behind (reports, exports, schedules).

pub mod assemble;
pub mod config;
pub mod export;
pub mod normalize;
pub mod pipeline;
pub mod reports;
pub mod rules;
pub mod schedule;
pub mod skills;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use jobmarket_adapters::{PortalListingExtractor, RecordExtractor, ReplayPageSource};
use jobmarket_core::ScrapeRunLog;
use jobmarket_storage::{JobStore, PageArchive, PageFetcher, PageSource, RateLimitConfig};
use tokio::sync::{watch, Mutex};
use tracing::info;

pub use assemble::{CandidateAssembler, RejectReason};
pub use config::{RateLimitSettings, ScheduleSettings, ScrapeConfig, CONFIG_FILE};
pub use export::{export_dataset, ExportFile, ExportManifest};
pub use normalize::Normalizer;
pub use pipeline::{
    Clock, FixedClock, PipelinePolicy, PipelineState, RunReport, ScrapePipeline, SystemClock,
};
pub use reports::{load_reported_runs, RunReporter};
pub use rules::RuleSet;
pub use schedule::build_scheduler;
pub use skills::SkillExtractor;

pub const CRATE_NAME: &str = "jobmarket-sync";

/// Long-lived entry point shared by the CLI and the scheduler. Runs are
/// serialised: a second caller waits for the current run to finish.
pub struct ScrapeService {
    config: ScrapeConfig,
    assembler: Arc<CandidateAssembler>,
    extractor: Arc<dyn RecordExtractor>,
    store: JobStore,
    run_lock: Mutex<()>,
    stop: Option<watch::Receiver<bool>>,
}

impl ScrapeService {
    pub async fn from_config(config: ScrapeConfig) -> Result<Self> {
        let store = JobStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening job store {}", config.database_url))?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: ScrapeConfig, store: JobStore) -> Result<Self> {
        let rules = RuleSet::load(&config.rules_dir)
            .with_context(|| format!("loading rule tables from {}", config.rules_dir.display()))?;
        let normalizer = Normalizer::new(&rules.cities).context("compiling normalizer patterns")?;
        let extractor = PortalListingExtractor::new(&rules.selectors, Some(config.base_url.as_str()))
            .context("compiling listing selectors")?;
        Ok(Self {
            assembler: Arc::new(CandidateAssembler::new(normalizer, SkillExtractor::new(&rules.skills))),
            extractor: Arc::new(extractor),
            store,
            config,
            run_lock: Mutex::new(()),
            stop: None,
        })
    }

    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Scrapes up to `max_pages` live listing pages and returns the finalised run log.
    pub async fn run_scrape(&self, max_pages: u32, rate_limit: RateLimitConfig) -> Result<ScrapeRunLog> {
        let mut http = self.config.http_client_config();
        http.rate_limit = rate_limit;
        let fetcher = PageFetcher::new(self.config.listing_urls(), http).context("building page fetcher")?;
        let report = self
            .run_pipeline(Arc::new(fetcher), max_pages, self.config.archive_pages)
            .await;
        Ok(report.log)
    }

    /// Re-runs extraction and persistence over a directory of captured pages.
    pub async fn replay(&self, dir: &Path, max_pages: Option<u32>) -> Result<RunReport> {
        if !dir.is_dir() {
            bail!("replay directory {} does not exist", dir.display());
        }
        let source = ReplayPageSource::new(dir);
        let captured = source.page_count();
        if captured == 0 {
            bail!("no captured pages in {}", dir.display());
        }
        info!(dir = %dir.display(), captured, "replaying captured pages");
        Ok(self
            .run_pipeline(Arc::new(source), max_pages.unwrap_or(captured), false)
            .await)
    }

    /// Runs against any page source, archiving pages per configuration.
    pub async fn run_with_source(&self, source: Arc<dyn PageSource>, max_pages: u32) -> RunReport {
        self.run_pipeline(source, max_pages, self.config.archive_pages).await
    }

    async fn run_pipeline(&self, source: Arc<dyn PageSource>, max_pages: u32, archive: bool) -> RunReport {
        let _running = self.run_lock.lock().await;
        let policy = PipelinePolicy {
            max_pages,
            end_on_empty_page: self.config.end_on_empty_page,
            consecutive_failure_threshold: self.config.consecutive_failure_threshold,
            fetch_descriptions: self.config.fetch_descriptions,
        };
        let mut pipeline = ScrapePipeline::new(
            source,
            Arc::clone(&self.extractor),
            Arc::clone(&self.assembler),
            self.store.clone(),
            policy,
        )
        .with_reporter(RunReporter::new(self.config.reports_dir.clone()));
        if archive {
            pipeline = pipeline.with_archive(PageArchive::new(self.config.artifacts_dir.clone()));
        }
        if let Some(stop) = &self.stop {
            pipeline = pipeline.with_stop_signal(stop.clone());
        }
        pipeline.run().await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixtures_dir, service_with};
    use jobmarket_core::RunStatus;
    use jobmarket_storage::{BackoffPolicy, PacingPolicy};
    use std::time::Duration;

    #[tokio::test]
    async fn replay_writes_report_and_skips_archiving() {
        let (service, dir) = service_with(|_| {}).await;
        let report = service.replay(&fixtures_dir(), None).await.expect("replay fixtures");

        assert_eq!(report.log.status, RunStatus::Ok);
        assert_eq!(report.log.records_inserted, 4);
        assert!(report.archived.is_empty());
        assert!(!dir.path().join("artifacts").exists());

        let runs = load_reported_runs(&dir.path().join("reports"), 5).expect("load reported runs");
        assert_eq!(runs, vec![report.log.clone()]);
        assert_eq!(service.store().recent_runs(5).await.expect("recent runs"), vec![report.log]);
    }

    #[tokio::test]
    async fn replay_of_missing_directory_is_an_error() {
        let (service, dir) = service_with(|_| {}).await;
        assert!(service.replay(&dir.path().join("nope"), None).await.is_err());
        assert!(service.replay(dir.path(), None).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_portal_aborts_with_a_finalised_log() {
        let (service, _dir) = service_with(|c| {
            c.base_url = "http://127.0.0.1:9".to_string();
            c.consecutive_failure_threshold = 2;
            c.rate_limit.timeout_secs = 2;
        })
        .await;
        let rate_limit = RateLimitConfig {
            pacing: PacingPolicy::none(),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            rate_limit_cooldown: Duration::from_millis(1),
        };

        let log = service.run_scrape(10, rate_limit).await.expect("run scrape");
        assert_eq!(log.status, RunStatus::Aborted);
        assert_eq!(log.pages_requested, 2);
        assert_eq!(log.pages_failed, 2);
        assert!(log.is_finalized());
        assert_eq!(service.store().run_log(log.run_id).await.expect("load run log"), Some(log));
    }
}
