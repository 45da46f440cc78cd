//! Rate-limited listing page fetcher with retry/backoff.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Minimum spacing plus uniform jitter applied before every request.
#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    pub min_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_jitter: Duration::from_millis(1500),
        }
    }
}

impl PacingPolicy {
    pub fn none() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.min_delay + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub pacing: PacingPolicy,
    pub backoff: BackoffPolicy,
    /// Wait applied once after a 429 before the single retry.
    pub rate_limit_cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            pacing: PacingPolicy::default(),
            backoff: BackoffPolicy::default(),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit: RateLimitConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Builds listing page URLs: page 1 is the search URL itself, later pages
/// append `page_suffix` with `{page}` substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingUrlTemplate {
    pub first_page: String,
    pub page_suffix: String,
}

impl ListingUrlTemplate {
    pub fn new(base_url: &str, search_path: &str, page_suffix: impl Into<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        let path = search_path.trim_start_matches('/');
        Self {
            first_page: format!("{base}/{path}"),
            page_suffix: page_suffix.into(),
        }
    }

    pub fn url_for(&self, page_index: u32) -> String {
        if page_index <= 1 {
            self.first_page.clone()
        } else {
            format!(
                "{}{}",
                self.first_page,
                self.page_suffix.replace("{page}", &page_index.to_string())
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page_index: u32,
    pub url: String,
    pub status: u16,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
    /// Time spent in backoff and rate-limit cool-down, excluding pacing.
    pub retry_wait: Duration,
}

impl FetchedPage {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Terminal,
    RateLimited,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page {page_index} ({url}) still failing after {attempts} attempts: {message}")]
    Transient {
        page_index: u32,
        url: String,
        attempts: u32,
        message: String,
    },
    #[error("page {page_index} ({url}) failed permanently: {message}")]
    Terminal {
        page_index: u32,
        url: String,
        status: Option<u16>,
        message: String,
    },
    #[error("page {page_index} ({url}) rate limited again after cool-down")]
    RateLimited { page_index: u32, url: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Transient { .. } => FetchErrorKind::Transient,
            Self::Terminal { .. } => FetchErrorKind::Terminal,
            Self::RateLimited { .. } => FetchErrorKind::RateLimited,
        }
    }

    pub fn page_index(&self) -> u32 {
        match self {
            Self::Transient { page_index, .. }
            | Self::Terminal { page_index, .. }
            | Self::RateLimited { page_index, .. } => *page_index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub disposition: RetryDisposition,
    pub message: String,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::NonRetryable,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }
}

/// One GET against the network; retry policy lives in [`PageFetcher`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = if status.is_success() {
            resp.bytes().await?.to_vec()
        } else {
            Vec::new()
        };
        Ok(TransportResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Anything that can hand the orchestrator a listing page by index.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page_index: u32) -> Result<FetchedPage, FetchError>;

    /// A posting's detail page, linked from listing page `page_index`.
    async fn fetch_detail(&self, page_index: u32, url: &str) -> Result<FetchedPage, FetchError> {
        Err(FetchError::Terminal {
            page_index,
            url: url.to_string(),
            status: None,
            message: "this source has no detail pages".to_string(),
        })
    }
}

#[derive(Debug)]
pub struct PageFetcher<T = ReqwestTransport> {
    transport: T,
    urls: ListingUrlTemplate,
    rate_limit: RateLimitConfig,
}

impl PageFetcher<ReqwestTransport> {
    pub fn new(urls: ListingUrlTemplate, config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(transport, urls, config.rate_limit))
    }
}

impl<T: Transport> PageFetcher<T> {
    pub fn with_transport(transport: T, urls: ListingUrlTemplate, rate_limit: RateLimitConfig) -> Self {
        Self {
            transport,
            urls,
            rate_limit,
        }
    }

    pub fn urls(&self) -> &ListingUrlTemplate {
        &self.urls
    }

    pub async fn fetch(&self, page_index: u32) -> Result<FetchedPage, FetchError> {
        let url = self.urls.url_for(page_index);
        let span = info_span!("page_fetch", page = page_index, url = %url);
        self.fetch_with_retries(page_index, url).instrument(span).await
    }

    /// Same pacing and retry rules as listing pages.
    pub async fn fetch_detail_page(&self, page_index: u32, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("detail_fetch", page = page_index, url = %url);
        self.fetch_with_retries(page_index, url.to_string())
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(&self, page_index: u32, url: String) -> Result<FetchedPage, FetchError> {
        let backoff = self.rate_limit.backoff;
        let mut attempts = 0u32;
        let mut transient_failures = 0usize;
        let mut cooled_down = false;
        let mut retry_wait = Duration::ZERO;

        loop {
            tokio::time::sleep(self.rate_limit.pacing.next_delay()).await;
            attempts += 1;

            let (disposition, status, message) = match self.transport.get(&url).await {
                Ok(resp) if resp.status.is_success() => {
                    return match String::from_utf8(resp.body) {
                        Ok(html) if !html.trim().is_empty() => {
                            debug!(attempts, bytes = html.len(), "page fetched");
                            Ok(FetchedPage {
                                page_index,
                                url: resp.final_url,
                                status: resp.status.as_u16(),
                                html,
                                fetched_at: Utc::now(),
                                attempts,
                                retry_wait,
                            })
                        }
                        Ok(_) => Err(FetchError::Terminal {
                            page_index,
                            url,
                            status: Some(resp.status.as_u16()),
                            message: "empty response body".to_string(),
                        }),
                        Err(_) => Err(FetchError::Terminal {
                            page_index,
                            url,
                            status: Some(resp.status.as_u16()),
                            message: "response body is not valid UTF-8".to_string(),
                        }),
                    };
                }
                Ok(resp) => (
                    classify_status(resp.status),
                    Some(resp.status.as_u16()),
                    format!("http status {}", resp.status.as_u16()),
                ),
                Err(err) => (err.disposition, None, err.message),
            };

            match disposition {
                RetryDisposition::RateLimited if !cooled_down => {
                    cooled_down = true;
                    let wait = self.rate_limit.rate_limit_cooldown;
                    warn!(?wait, "rate limited; cooling down before one retry");
                    tokio::time::sleep(wait).await;
                    retry_wait += wait;
                }
                RetryDisposition::RateLimited => {
                    return Err(FetchError::RateLimited { page_index, url });
                }
                RetryDisposition::Retryable if transient_failures < backoff.max_retries => {
                    let wait = backoff.delay_for_attempt(transient_failures);
                    transient_failures += 1;
                    warn!(attempt = attempts, ?wait, %message, "transient fetch failure; backing off");
                    tokio::time::sleep(wait).await;
                    retry_wait += wait;
                }
                RetryDisposition::Retryable => {
                    return Err(FetchError::Transient {
                        page_index,
                        url,
                        attempts,
                        message,
                    });
                }
                RetryDisposition::NonRetryable => {
                    return Err(FetchError::Terminal {
                        page_index,
                        url,
                        status,
                        message,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl<T: Transport> PageSource for PageFetcher<T> {
    async fn fetch_page(&self, page_index: u32) -> Result<FetchedPage, FetchError> {
        self.fetch(page_index).await
    }

    async fn fetch_detail(&self, page_index: u32, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_detail_page(page_index, url).await
    }
}
