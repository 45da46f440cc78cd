//! Per-run report files under `reports/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobmarket_core::ScrapeRunLog;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::pipeline::RunReport;

pub const RUN_LOG_FILE: &str = "run_log.json";
pub const RUN_BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone)]
pub struct RunReporter {
    reports_dir: PathBuf,
}

impl RunReporter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn run_dir(&self, report: &RunReport) -> PathBuf {
        self.reports_dir.join(report.log.run_id.to_string())
    }

    /// Writes `run_log.json` and `run_brief.md`, returning the run directory.
    pub async fn write(&self, report: &RunReport) -> Result<PathBuf> {
        let dir = self.run_dir(report);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        write_atomically(&dir, RUN_LOG_FILE, &json).await?;
        write_atomically(&dir, RUN_BRIEF_FILE, render_brief(report).as_bytes()).await?;
        Ok(dir)
    }
}

/// Readers never see a half-written file: bytes go to a temp file that is
/// renamed over the target.
async fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let target = dir.join(name);
    let temp = dir.join(format!(".{name}.{}.tmp", Uuid::new_v4()));
    fs::write(&temp, bytes)
        .await
        .with_context(|| format!("writing {}", temp.display()))?;
    if let Err(err) = fs::rename(&temp, &target).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err).with_context(|| format!("renaming {} -> {}", temp.display(), target.display()));
    }
    Ok(())
}

pub fn render_brief(report: &RunReport) -> String {
    let log = &report.log;
    let finished = log
        .finished_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let mut lines = vec![
        "# Scrape Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", log.run_id),
        format!("- Status: {}", log.status),
        format!("- Started: {}", log.started_at.to_rfc3339()),
        format!("- Finished: {finished}"),
        format!("- Extractor: {}", report.extractor_id),
        format!(
            "- Pages: {} requested, {} succeeded, {} failed, {} empty",
            log.pages_requested, log.pages_succeeded, log.pages_failed, log.pages_empty
        ),
        format!("- Fetch retries: {}", log.fetch_retries),
        format!(
            "- Records: {} extracted, {} inserted, {} updated, {} duplicate, {} invalid",
            log.records_extracted,
            log.records_inserted,
            log.records_updated,
            log.records_skipped_duplicate,
            log.records_skipped_invalid
        ),
        format!("- Errors: {}", log.error_count),
    ];
    let (described, undescribed) = report.pages.iter().fold((0, 0), |(ok, failed), page| {
        (ok + page.descriptions_fetched, failed + page.descriptions_failed)
    });
    if described + undescribed > 0 {
        lines.push(format!("- Descriptions: {described} fetched, {undescribed} failed"));
    }
    if !report.persisted_to_store {
        lines.push("- Run log NOT persisted to the store; this report is the record.".to_string());
    }
    if !report.page_failures.is_empty() {
        lines.push(String::new());
        lines.push("## Page Failures".to_string());
        lines.extend(
            report
                .page_failures
                .iter()
                .map(|f| format!("- page {} ({}): {}", f.page_index, f.kind, f.message)),
        );
    }
    if !report.archived.is_empty() {
        lines.push(String::new());
        lines.push("## Archived Pages".to_string());
        lines.extend(
            report
                .archived
                .iter()
                .map(|a| format!("- `{}` sha256 {}", a.relative_path, a.content_hash)),
        );
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Run logs from report directories, newest first. Directories without a
/// readable `run_log.json` are skipped, and so are logs that fail to decode.
pub fn load_reported_runs(reports_dir: &Path, limit: usize) -> Result<Vec<ScrapeRunLog>> {
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;

    let mut runs = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path().join(RUN_LOG_FILE);
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        match decode_run_log(&text) {
            Ok(Some(log)) => runs.push(log),
            Ok(None) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run log"),
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.run_id.cmp(&b.run_id)));
    runs.truncate(limit.max(1));
    Ok(runs)
}

fn decode_run_log(text: &str) -> serde_json::Result<Option<ScrapeRunLog>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    value
        .get("log")
        .map(|log| serde_json::from_value(log.clone()))
        .transpose()
}
