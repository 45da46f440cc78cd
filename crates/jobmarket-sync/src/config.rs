use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use jobmarket_storage::{BackoffPolicy, HttpClientConfig, ListingUrlTemplate, PacingPolicy, RateLimitConfig};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "jobmarket.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub min_delay_ms: u64,
    pub max_jitter_ms: u64,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_jitter_ms: 1_500,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            rate_limit_cooldown_ms: 60_000,
            timeout_secs: 30,
        }
    }
}

impl RateLimitSettings {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            pacing: PacingPolicy {
                min_delay: Duration::from_millis(self.min_delay_ms),
                max_jitter: Duration::from_millis(self.max_jitter_ms),
            },
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
            rate_limit_cooldown: Duration::from_millis(self.rate_limit_cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub enabled: bool,
    /// Six-field cron expressions (seconds first).
    pub crons: Vec<String>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            crons: vec!["0 0 6 * * *".to_string(), "0 0 18 * * *".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub base_url: String,
    pub search_path: String,
    /// Appended to `search_path` from page 2 on; `{page}` is the page number.
    pub page_suffix: String,
    pub max_pages: u32,
    pub rate_limit: RateLimitSettings,
    pub user_agent: String,
    pub end_on_empty_page: bool,
    pub consecutive_failure_threshold: u32,
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_pages: bool,
    /// Fetch each posting's detail page for its description.
    pub fetch_descriptions: bool,
    pub rules_dir: PathBuf,
    pub web_port: u16,
    pub schedule: ScheduleSettings,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.naukri.com".to_string(),
            search_path: "/data-analyst-jobs".to_string(),
            page_suffix: "-{page}".to_string(),
            max_pages: 50,
            rate_limit: RateLimitSettings::default(),
            user_agent: "jobmarket-bot/0.1".to_string(),
            end_on_empty_page: true,
            consecutive_failure_threshold: 3,
            database_url: "sqlite://job_market.db".to_string(),
            artifacts_dir: PathBuf::from("artifacts"),
            reports_dir: PathBuf::from("reports"),
            archive_pages: true,
            fetch_descriptions: false,
            rules_dir: PathBuf::from("rules"),
            web_port: 8080,
            schedule: ScheduleSettings::default(),
        }
    }
}

impl ScrapeConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads `jobmarket.yaml` (or `$JOBMARKET_CONFIG`) under `workspace_root`,
    /// applies environment overrides and anchors relative directories at the root.
    pub fn from_env(workspace_root: &Path) -> Result<Self> {
        let path = std::env::var("JOBMARKET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join(CONFIG_FILE));
        let mut config = Self::load(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.anchor_paths(workspace_root);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = lookup("ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(dir);
        }
        if let Some(agent) = lookup("JOBMARKET_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(pages) = lookup("JOBMARKET_MAX_PAGES") {
            self.max_pages = pages
                .trim()
                .parse()
                .with_context(|| format!("JOBMARKET_MAX_PAGES must be a page count, got `{pages}`"))?;
        }
        if let Some(flag) = lookup("JOBMARKET_SCHEDULER_ENABLED") {
            self.schedule.enabled = matches!(flag.trim(), "1" | "true" | "TRUE" | "True" | "yes");
        }
        if let Some(port) = lookup("JOBMARKET_WEB_PORT") {
            self.web_port = port
                .trim()
                .parse()
                .with_context(|| format!("JOBMARKET_WEB_PORT must be a port number, got `{port}`"))?;
        }
        Ok(())
    }

    pub fn anchor_paths(&mut self, workspace_root: &Path) {
        for dir in [&mut self.artifacts_dir, &mut self.reports_dir, &mut self.rules_dir] {
            if dir.is_relative() {
                *dir = workspace_root.join(&*dir);
            }
        }
    }

    pub fn listing_urls(&self) -> ListingUrlTemplate {
        ListingUrlTemplate::new(&self.base_url, &self.search_path, self.page_suffix.clone())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.rate_limit.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: self.rate_limit.to_rate_limit_config(),
        }
    }
}
