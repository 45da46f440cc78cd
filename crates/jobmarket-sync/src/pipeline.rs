//! Sequential fetch → extract → normalize → store loop over listing pages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobmarket_adapters::{missing_fields, ExtractionError, RecordExtractor};
use jobmarket_core::{RawCandidate, RunStatus, ScrapeRunLog, UpsertOutcome};
use jobmarket_storage::{FetchError, FetchedPage, JobStore, PageArchive, PageSource};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::assemble::CandidateAssembler;
use crate::reports::RunReporter;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Fetching { page: u32 },
    Extracting { page: u32 },
    PersistingBatch { page: u32 },
    Draining,
    Aborted,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePolicy {
    pub max_pages: u32,
    pub end_on_empty_page: bool,
    /// Back-to-back page fetch failures that abort the run.
    pub consecutive_failure_threshold: u32,
    /// Follow each posting's link and keep the detail page description.
    pub fetch_descriptions: bool,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            max_pages: 50,
            end_on_empty_page: true,
            consecutive_failure_threshold: 3,
            fetch_descriptions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSummary {
    pub page_index: u32,
    pub attempts: u32,
    pub retry_wait_ms: u64,
    pub candidates: u32,
    pub descriptions_fetched: u32,
    pub descriptions_failed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedPageSummary {
    pub page_index: u32,
    pub relative_path: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFailure {
    pub page_index: u32,
    pub kind: String,
    pub message: String,
}

/// Everything a finished run produced besides the stored postings.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub log: ScrapeRunLog,
    pub extractor_id: String,
    pub transitions: Vec<PipelineState>,
    pub pages: Vec<PageSummary>,
    pub archived: Vec<ArchivedPageSummary>,
    pub page_failures: Vec<PageFailure>,
    /// `false` when the final run log could not be written to the store.
    pub persisted_to_store: bool,
}

impl RunReport {
    pub fn final_state(&self) -> Option<PipelineState> {
        self.transitions.last().copied()
    }
}

struct RunState {
    log: ScrapeRunLog,
    state: PipelineState,
    transitions: Vec<PipelineState>,
    pages: Vec<PageSummary>,
    archived: Vec<ArchivedPageSummary>,
    page_failures: Vec<PageFailure>,
}

impl RunState {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            log: ScrapeRunLog::open(run_id, started_at),
            state: PipelineState::Idle,
            transitions: vec![PipelineState::Idle],
            pages: Vec::new(),
            archived: Vec::new(),
            page_failures: Vec::new(),
        }
    }

    fn enter(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "pipeline transition");
        self.state = next;
        self.transitions.push(next);
    }

    fn fail_page(&mut self, page_index: u32, kind: &str, message: String) {
        self.log.pages_failed += 1;
        self.log.error_count += 1;
        self.page_failures.push(PageFailure {
            page_index,
            kind: kind.to_string(),
            message,
        });
    }
}

pub struct ScrapePipeline {
    source: Arc<dyn PageSource>,
    extractor: Arc<dyn RecordExtractor>,
    assembler: Arc<CandidateAssembler>,
    store: JobStore,
    policy: PipelinePolicy,
    archive: Option<PageArchive>,
    reporter: Option<RunReporter>,
    clock: Arc<dyn Clock>,
    stop: Option<watch::Receiver<bool>>,
}

impl ScrapePipeline {
    pub fn new(
        source: Arc<dyn PageSource>,
        extractor: Arc<dyn RecordExtractor>,
        assembler: Arc<CandidateAssembler>,
        store: JobStore,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            source,
            extractor,
            assembler,
            store,
            policy,
            archive: None,
            reporter: None,
            clock: Arc::new(SystemClock),
            stop: None,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_reporter(mut self, reporter: RunReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The run aborts at the next page boundary once the watched value is `true`.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Drives one run to completion. Never fails: every problem ends up
    /// counted in the returned run log.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let span = info_span!("scrape_run", %run_id);
        self.drive(run_id, started_at).instrument(span).await
    }

    async fn drive(&self, run_id: Uuid, started_at: DateTime<Utc>) -> RunReport {
        let mut run = RunState::new(run_id, started_at);
        info!(
            max_pages = self.policy.max_pages,
            extractor = self.extractor.extractor_id(),
            "scrape run started"
        );
        if let Err(err) = self.store.open_run_log(&run.log).await {
            error!(error = %err, "could not open run log");
            run.log.error_count += 1;
        }

        let mut consecutive_failures = 0u32;
        let mut page_index = 1u32;
        let end = loop {
            if page_index > self.policy.max_pages {
                info!(max_pages = self.policy.max_pages, "page limit reached");
                break PipelineState::Draining;
            }
            if self.stop_requested() {
                warn!(next_page = page_index, "stop requested; aborting between pages");
                break PipelineState::Aborted;
            }

            run.enter(PipelineState::Fetching { page: page_index });
            run.log.pages_requested += 1;
            let fetched = match self.source.fetch_page(page_index).await {
                Ok(page) => {
                    consecutive_failures = 0;
                    page
                }
                Err(err) => {
                    consecutive_failures += 1;
                    run.log.fetch_retries += retries_spent(&err);
                    warn!(
                        page = page_index,
                        kind = ?err.kind(),
                        consecutive_failures,
                        error = %err,
                        "page fetch failed"
                    );
                    run.fail_page(page_index, fetch_kind(&err), err.to_string());
                    if consecutive_failures >= self.policy.consecutive_failure_threshold {
                        error!(consecutive_failures, "consecutive failure threshold reached; aborting run");
                        break PipelineState::Aborted;
                    }
                    page_index += 1;
                    continue;
                }
            };
            run.log.fetch_retries += fetched.retries();
            self.archive_page(&mut run, &fetched).await;

            run.enter(PipelineState::Extracting { page: page_index });
            let mut candidates = match self.extract(&fetched) {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(page = page_index, error = %err, "page markup not recognised; skipping page");
                    run.fail_page(page_index, "markup_unrecognized", err.to_string());
                    page_index += 1;
                    continue;
                }
            };
            let (descriptions_fetched, descriptions_failed) = if self.policy.fetch_descriptions {
                self.fetch_descriptions(&mut run, page_index, &mut candidates).await
            } else {
                (0, 0)
            };

            run.enter(PipelineState::PersistingBatch { page: page_index });
            self.persist(&mut run, &candidates, started_at).await;
            run.log.pages_succeeded += 1;
            run.pages.push(PageSummary {
                page_index,
                attempts: fetched.attempts,
                retry_wait_ms: u64::try_from(fetched.retry_wait.as_millis()).unwrap_or(u64::MAX),
                candidates: u32::try_from(candidates.len()).unwrap_or(u32::MAX),
                descriptions_fetched,
                descriptions_failed,
            });
            info!(page = page_index, candidates = candidates.len(), "page processed");

            if candidates.is_empty() {
                run.log.pages_empty += 1;
                if self.policy.end_on_empty_page {
                    info!(page = page_index, "empty page; treating as end of results");
                    break PipelineState::Draining;
                }
            }
            page_index += 1;
        };

        run.enter(end);
        let status = if end == PipelineState::Aborted {
            RunStatus::Aborted
        } else if run.log.pages_failed > 0 || run.log.error_count > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Ok
        };
        run.log.finalize(status, self.clock.now());
        run.enter(PipelineState::Completed);

        let persisted_to_store = match self.store.append_run_log(&run.log).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "could not append run log; report file is the only record");
                false
            }
        };

        let report = RunReport {
            log: run.log,
            extractor_id: self.extractor.extractor_id().to_string(),
            transitions: run.transitions,
            pages: run.pages,
            archived: run.archived,
            page_failures: run.page_failures,
            persisted_to_store,
        };
        if let Some(reporter) = &self.reporter {
            if let Err(err) = reporter.write(&report).await {
                error!(error = format!("{err:#}"), "could not write run report");
            }
        }

        let log = &report.log;
        info!(
            status = %log.status,
            pages_succeeded = log.pages_succeeded,
            pages_failed = log.pages_failed,
            inserted = log.records_inserted,
            updated = log.records_updated,
            skipped = log.records_skipped(),
            "scrape run finished"
        );
        report
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn archive_page(&self, run: &mut RunState, page: &FetchedPage) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.store_page(run.log.started_at, page.page_index, &page.html).await {
            Ok(stored) => run.archived.push(ArchivedPageSummary {
                page_index: stored.page_index,
                relative_path: stored.relative_path.display().to_string(),
                content_hash: stored.content_hash,
                byte_size: stored.byte_size,
                unchanged: stored.unchanged,
            }),
            Err(err) => {
                warn!(page = page.page_index, error = format!("{err:#}"), "could not archive page");
                run.log.error_count += 1;
            }
        }
    }

    /// Attaches the detail page description to every linked candidate.
    /// A failed detail fetch leaves that candidate as listed and is not a run error.
    async fn fetch_descriptions(
        &self,
        run: &mut RunState,
        page_index: u32,
        candidates: &mut [RawCandidate],
    ) -> (u32, u32) {
        let (mut fetched, mut failed) = (0u32, 0u32);
        for candidate in candidates.iter_mut() {
            let Some(url) = candidate.source_url.clone() else {
                continue;
            };
            match self.source.fetch_detail(page_index, &url).await {
                Ok(detail) => {
                    run.log.fetch_retries += detail.retries();
                    self.archive_detail(run, page_index, &url, &detail.html).await;
                    candidate.description_text = self.extractor.parse_description(&detail.html);
                    fetched += 1;
                }
                Err(err) => {
                    run.log.fetch_retries += retries_spent(&err);
                    warn!(page = page_index, %url, kind = ?err.kind(), error = %err, "detail fetch failed; keeping listing data");
                    failed += 1;
                }
            }
        }
        debug!(page = page_index, fetched, failed, "descriptions fetched");
        (fetched, failed)
    }

    async fn archive_detail(&self, run: &mut RunState, page_index: u32, url: &str, html: &str) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.store_detail(run.log.started_at, page_index, url, html).await {
            Ok(stored) => run.archived.push(ArchivedPageSummary {
                page_index: stored.page_index,
                relative_path: stored.relative_path.display().to_string(),
                content_hash: stored.content_hash,
                byte_size: stored.byte_size,
                unchanged: stored.unchanged,
            }),
            Err(err) => {
                warn!(page = page_index, %url, error = format!("{err:#}"), "could not archive detail page");
                run.log.error_count += 1;
            }
        }
    }

    /// The parsed document is not `Send`, so it lives only inside this call.
    fn extract(&self, page: &FetchedPage) -> Result<Vec<RawCandidate>, ExtractionError> {
        let listing = self.extractor.parse(page.page_index, &page.html)?;
        let candidates: Vec<RawCandidate> = listing.candidates().collect();
        if candidates.is_empty() && listing.reports_no_results() {
            debug!(page = page.page_index, "portal reports no further results");
        }
        for candidate in &candidates {
            for missing in missing_fields(candidate) {
                debug!(page = page.page_index, %missing, "optional field absent");
            }
        }
        Ok(candidates)
    }

    async fn persist(&self, run: &mut RunState, candidates: &[RawCandidate], scraped_at: DateTime<Utc>) {
        for raw in candidates {
            run.log.records_extracted += 1;
            let posting = match self.assembler.assemble(raw, scraped_at) {
                Ok(posting) => posting,
                Err(reason) => {
                    warn!(page = raw.page_index, %reason, "skipping invalid candidate");
                    run.log.records_skipped_invalid += 1;
                    continue;
                }
            };
            match self.store.upsert(&posting).await {
                Ok(UpsertOutcome::Inserted) => run.log.records_inserted += 1,
                Ok(UpsertOutcome::Updated) => run.log.records_updated += 1,
                Ok(UpsertOutcome::SkippedUnchanged) => run.log.records_skipped_duplicate += 1,
                Err(err) => {
                    error!(key = %posting.identity_key, error = %err, "upsert failed; record skipped");
                    run.log.records_skipped_invalid += 1;
                    run.log.error_count += 1;
                }
            }
        }
    }
}

/// Retries already spent inside the fetcher before it gave up.
fn retries_spent(err: &FetchError) -> u32 {
    match err {
        FetchError::Transient { attempts, .. } => attempts.saturating_sub(1),
        FetchError::RateLimited { .. } => 1,
        FetchError::Terminal { .. } => 0,
    }
}

fn fetch_kind(err: &FetchError) -> &'static str {
    match err {
        FetchError::Transient { .. } => "fetch_transient",
        FetchError::Terminal { .. } => "fetch_terminal",
        FetchError::RateLimited { .. } => "fetch_rate_limited",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assembler, extractor, fixtures_dir};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use jobmarket_adapters::ReplayPageSource;
    use jobmarket_storage::{
        BackoffPolicy, ListingUrlTemplate, PacingPolicy, PageFetcher, RateLimitConfig, StatusCode,
        Transport, TransportError, TransportResponse,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).single().expect("valid timestamp")
    }

    fn pipeline(source: Arc<dyn PageSource>, store: &JobStore, policy: PipelinePolicy) -> ScrapePipeline {
        ScrapePipeline::new(
            source,
            Arc::new(extractor()),
            Arc::new(assembler()),
            store.clone(),
            policy,
        )
        .with_clock(Arc::new(FixedClock(t0())))
    }

    fn replay() -> Arc<dyn PageSource> {
        Arc::new(ReplayPageSource::new(fixtures_dir()))
    }

    #[tokio::test]
    async fn fixture_run_stops_on_the_empty_page() {
        let store = JobStore::in_memory().await.expect("in-memory store");
        let report = pipeline(replay(), &store, PipelinePolicy::default()).run().await;
        let log = &report.log;

        assert_eq!(log.status, RunStatus::Ok);
        assert_eq!(log.pages_requested, 3);
        assert_eq!(log.pages_succeeded, 3);
        assert_eq!(log.pages_empty, 1);
        assert_eq!(log.pages_failed, 0);
        assert_eq!(log.records_extracted, 6);
        assert_eq!(log.records_inserted, 4);
        assert_eq!(log.records_skipped_duplicate, 1);
        assert_eq!(log.records_skipped_invalid, 1);
        assert_eq!(log.finished_at, Some(t0()));
        assert!(report.persisted_to_store);

        assert_eq!(
            &report.transitions[report.transitions.len() - 3..],
            &[
                PipelineState::PersistingBatch { page: 3 },
                PipelineState::Draining,
                PipelineState::Completed
            ]
        );
        assert_eq!(store.count_postings().await.expect("count postings"), 4);
        assert_eq!(store.run_log(log.run_id).await.expect("load run log").as_ref(), Some(log));
    }

    #[tokio::test]
    async fn second_run_over_the_same_pages_changes_nothing() {
        let store = JobStore::in_memory().await.expect("in-memory store");
        pipeline(replay(), &store, PipelinePolicy::default()).run().await;
        let postings_before = store.postings_since(None).await.expect("load postings");
        let skills_before = store.count_skill_associations().await.expect("count skill rows");

        let report = pipeline(replay(), &store, PipelinePolicy::default()).run().await;
        assert_eq!(report.log.records_inserted, 0);
        assert_eq!(report.log.records_updated, 0);
        assert_eq!(report.log.records_skipped_duplicate, 5);
        assert_eq!(store.postings_since(None).await.expect("load postings"), postings_before);
        assert_eq!(store.count_skill_associations().await.expect("count skill rows"), skills_before);
        assert_eq!(store.recent_runs(10).await.expect("recent runs").len(), 2);
    }

    #[tokio::test]
    async fn later_rescrape_counts_as_updated() {
        let store = JobStore::in_memory().await.expect("in-memory store");
        pipeline(replay(), &store, PipelinePolicy::default()).run().await;
        let keys_before: Vec<_> = store
            .postings_since(None)
            .await
            .expect("load postings")
            .into_iter()
            .map(|p| p.identity_key)
            .collect();

        let later = t0() + ChronoDuration::days(1);
        let report = pipeline(replay(), &store, PipelinePolicy::default())
            .with_clock(Arc::new(FixedClock(later)))
            .run()
            .await;
        assert_eq!(report.log.records_inserted, 0);
        assert_eq!(report.log.records_updated, 4);
        assert_eq!(report.log.records_skipped_duplicate, 1);

        let after = store.postings_since(None).await.expect("load postings");
        assert_eq!(after.iter().map(|p| p.identity_key.clone()).collect::<Vec<_>>(), keys_before);
        assert!(after.iter().all(|p| p.scraped_at == later));
    }

    #[tokio::test]
    async fn page_limit_drains_early() {
        let store = JobStore::in_memory().await.expect("in-memory store");
        let policy = PipelinePolicy {
            max_pages: 1,
            ..PipelinePolicy::default()
        };
        let report = pipeline(replay(), &store, policy).run().await;
        assert_eq!(report.log.pages_requested, 1);
        assert_eq!(report.log.records_inserted, 3);
        assert_eq!(report.log.status, RunStatus::Ok);
        assert!(report.transitions.contains(&PipelineState::Draining));
    }

    #[tokio::test]
    async fn consecutive_fetch_failures_abort_the_run() {
        let store = JobStore::in_memory().await.expect("in-memory store");
        let empty = tempfile::tempdir().expect("tempdir");
        let policy = PipelinePolicy {
            consecutive_failure_threshold: 2,
            ..PipelinePolicy::default()
        };
        let report = pipeline(Arc::new(ReplayPageSource::new(empty.path())), &store, policy)
            .run()
            .await;

        assert_eq!(report.log.status, RunStatus::Aborted);
        assert_eq!(report.log.pages_requested, 2);
        assert_eq!(report.log.pages_failed, 2);
        assert_eq!(report.final_state(), Some(PipelineState::Completed));
        assert!(report.transitions.contains(&PipelineState::Aborted));
        let stored = store.run_log(report.log.run_id).await.expect("load run log").expect("row present");
        assert_eq!(stored.status, RunStatus::Aborted);
        assert!(stored.finished_at.is_some());
    }

    fn copy_fixtures(pages: &[(u32, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for (index, fixture) in pages {
            std::fs::copy(
                fixtures_dir().join(fixture),
                dir.path().join(PageArchive::page_file_name(*index)),
            )
            .expect("copy fixture");
        }
        dir
    }

    #[tokio::test]
    async fn detail_descriptions_add_skills_without_failing_the_run() {
        let dir = copy_fixtures(&[(1, "page-0001.html")]);
        let listing_html = std::fs::read_to_string(fixtures_dir().join("page-0001.html")).expect("fixture page");
        let portal = extractor();
        let listing = portal.parse(1, &listing_html).expect("fixture markup");
        let first = listing.candidates().next().expect("first candidate");
        let url = first.source_url.expect("fixture link");
        let source = ReplayPageSource::new(dir.path());
        std::fs::write(
            source.detail_path(&url),
            "<html><body><div class='job-description'>Build Tableau dashboards for the sales team.</div></body></html>",
        )
        .expect("detail capture");

        let store = JobStore::in_memory().await.expect("store");
        let policy = PipelinePolicy {
            max_pages: 1,
            fetch_descriptions: true,
            ..PipelinePolicy::default()
        };
        let report = pipeline(Arc::new(source), &store, policy).run().await;

        // Only the first posting has a captured detail page.
        assert_eq!(report.log.status, RunStatus::Ok);
        assert_eq!(report.log.error_count, 0);
        assert_eq!(report.pages[0].descriptions_fetched, 1);
        assert_eq!(report.pages[0].descriptions_failed, 2);

        let postings = store.postings_since(None).await.expect("postings");
        let canonical = jobmarket_core::canonical_source_url(&url);
        let detailed = postings
            .iter()
            .find(|p| p.source_url == canonical)
            .expect("detailed posting");
        assert!(detailed.description.as_deref().is_some_and(|d| d.contains("Tableau")));
        let names: Vec<&str> = detailed.skills.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"tableau"));
        assert!(names.contains(&"python"));
        assert_eq!(postings.iter().filter(|p| p.description.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn isolated_page_failure_only_makes_the_run_partial() {
        // Page 2 is missing: a terminal failure between two good pages.
        let dir = copy_fixtures(&[(1, "page-0001.html"), (3, "page-0002.html"), (4, "page-0003.html")]);
        let store = JobStore::in_memory().await.expect("in-memory store");
        let report = pipeline(Arc::new(ReplayPageSource::new(dir.path())), &store, PipelinePolicy::default())
            .run()
            .await;

        assert_eq!(report.log.status, RunStatus::Partial);
        assert_eq!(report.log.pages_failed, 1);
        assert_eq!(report.log.pages_succeeded, 3);
        assert_eq!(report.log.records_inserted, 4);
        assert_eq!(report.page_failures[0].page_index, 2);
        assert_eq!(report.page_failures[0].kind, "fetch_terminal");
    }

    #[tokio::test]
    async fn unrecognised_markup_skips_the_page_and_continues() {
        let dir = copy_fixtures(&[(1, "page-0001.html"), (3, "page-0003.html")]);
        std::fs::write(
            dir.path().join(PageArchive::page_file_name(2)),
            "<html><body><form id='captcha'>verify you are human</form></body></html>",
        )
        .expect("write captcha page");
        let store = JobStore::in_memory().await.expect("in-memory store");
        let report = pipeline(Arc::new(ReplayPageSource::new(dir.path())), &store, PipelinePolicy::default())
            .run()
            .await;

        assert_eq!(report.log.status, RunStatus::Partial);
        assert_eq!(report.log.pages_failed, 1);
        assert_eq!(report.log.pages_empty, 1);
        assert_eq!(report.page_failures[0].kind, "markup_unrecognized");
        assert_eq!(report.log.records_inserted, 3);
    }

    struct StopDuringFirstPage {
        inner: ReplayPageSource,
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl PageSource for StopDuringFirstPage {
        async fn fetch_page(&self, page_index: u32) -> Result<FetchedPage, FetchError> {
            let page = self.inner.fetch_page(page_index).await;
            if page_index == 1 {
                self.stop.send_replace(true);
            }
            page
        }
    }

    #[tokio::test]
    async fn stop_signal_is_observed_between_pages() {
        let (tx, rx) = watch::channel(false);
        let source = Arc::new(StopDuringFirstPage {
            inner: ReplayPageSource::new(fixtures_dir()),
            stop: tx,
        });
        let store = JobStore::in_memory().await.expect("in-memory store");
        let report = pipeline(source, &store, PipelinePolicy::default())
            .with_stop_signal(rx)
            .run()
            .await;

        assert_eq!(report.log.status, RunStatus::Aborted);
        assert_eq!(report.log.pages_requested, 1);
        // The in-flight page still completes before the run stops.
        assert_eq!(report.log.records_inserted, 3);
        assert!(report.log.is_finalized());
    }

    /// Serves the fixture pages over a fake HTTP transport, answering the
    /// first request for page 2 with 429.
    struct FixtureTransport {
        throttled_once: AtomicBool,
    }

    #[async_trait]
    impl Transport for FixtureTransport {
        async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
            let page = match url.rsplit_once("-jobs") {
                Some((_, "")) => 1,
                Some((_, suffix)) => suffix.trim_start_matches('-').parse().unwrap_or(0),
                None => 0,
            };
            if page == 2 && !self.throttled_once.swap(true, Ordering::SeqCst) {
                return Ok(TransportResponse {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    final_url: url.to_string(),
                    body: Vec::new(),
                });
            }
            let body = std::fs::read(fixtures_dir().join(PageArchive::page_file_name(page)))
                .map_err(|err| TransportError::fatal(err.to_string()))?;
            Ok(TransportResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body,
            })
        }
    }

    #[tokio::test]
    async fn rate_limited_page_is_retried_after_cooldown() {
        let cooldown = Duration::from_millis(50);
        let fetcher = PageFetcher::with_transport(
            FixtureTransport {
                throttled_once: AtomicBool::new(false),
            },
            ListingUrlTemplate::new("https://portal.example", "/data-analyst-jobs", "-{page}"),
            RateLimitConfig {
                pacing: PacingPolicy::none(),
                backoff: BackoffPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(10),
                },
                rate_limit_cooldown: cooldown,
            },
        );
        let store = JobStore::in_memory().await.expect("in-memory store");
        let report = pipeline(Arc::new(fetcher), &store, PipelinePolicy::default()).run().await;

        assert_eq!(report.log.pages_failed, 0);
        assert_eq!(report.log.fetch_retries, 1);
        assert_eq!(report.log.status, RunStatus::Ok);
        let page2 = report.pages.iter().find(|p| p.page_index == 2).expect("matching entry");
        assert_eq!(page2.attempts, 2);
        assert!(page2.retry_wait_ms >= 50);
        assert_eq!(report.pages[0].attempts, 1);
    }

    #[tokio::test]
    async fn archived_pages_replay_to_the_same_store_state() {
        let artifacts = tempfile::tempdir().expect("tempdir");
        let store = JobStore::in_memory().await.expect("in-memory store");
        let report = pipeline(replay(), &store, PipelinePolicy::default())
            .with_archive(PageArchive::new(artifacts.path()))
            .run()
            .await;
        assert_eq!(report.archived.len(), 3);
        assert!(report.archived.iter().all(|a| a.content_hash.len() == 64));

        let run_dir = artifacts.path().join(PageArchive::run_dir_name(t0()));
        let replayed = JobStore::in_memory().await.expect("in-memory store");
        let again = pipeline(Arc::new(ReplayPageSource::new(&run_dir)), &replayed, PipelinePolicy::default())
            .run()
            .await;
        assert_eq!(again.log.records_inserted, 4);
        assert_eq!(
            replayed.postings_since(None).await.expect("load postings"),
            store.postings_since(None).await.expect("load postings")
        );
    }
}
