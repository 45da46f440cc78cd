//! Core domain model for the job-market scrape pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobmarket-core";

/// Unparsed field strings pulled from one listing container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub page_index: u32,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub experience_text: Option<String>,
    pub salary_text: Option<String>,
    pub skills_text: Option<String>,
    pub posted_text: Option<String>,
    pub source_url: Option<String>,
    /// Free text from the posting's detail page, when it was fetched.
    #[serde(default)]
    pub description_text: Option<String>,
}

impl RawCandidate {
    pub fn is_blank(&self) -> bool {
        [
            &self.title,
            &self.company,
            &self.location,
            &self.experience_text,
            &self.salary_text,
            &self.skills_text,
            &self.posted_text,
            &self.source_url,
        ]
        .iter()
        .all(|f| f.is_none())
    }
}

/// Deterministic identity of one posting across repeated scrapes.
///
/// Keys derived from a source URL are prefixed `url:`, keys derived from the
/// title/company/location composite are prefixed `cmp:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Prefers the source URL; falls back to the composite when the URL is
    /// absent or not an absolute http(s) URL.
    pub fn derive(
        source_url: Option<&str>,
        title: &str,
        company: Option<&str>,
        location: Option<&str>,
    ) -> Self {
        source_url
            .and_then(Self::from_source_url)
            .unwrap_or_else(|| Self::from_composite(title, company, location))
    }

    pub fn from_source_url(raw: &str) -> Option<Self> {
        let canonical = canonical_source_url(raw)?;
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical.as_bytes());
        Some(Self(format!("url:{id}")))
    }

    pub fn from_composite(title: &str, company: Option<&str>, location: Option<&str>) -> Self {
        let material = format!(
            "{}\u{1f}{}\u{1f}{}",
            fold_text(title),
            fold_text(company.unwrap_or_default()),
            fold_text(location.unwrap_or_default())
        );
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes());
        Self(format!("cmp:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_url_derived(&self) -> bool {
        self.0.starts_with("url:")
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdentityKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Query keys that vary between scrapes of the same listing.
const TRACKING_PARAMS: &[&str] = &["src", "sid", "xid", "xp", "px", "ref", "referrer", "trk", "fbclid", "gclid"];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Drops tracking parameters, fragment and trailing slash. Remaining query
/// parameters (a job id, say) are kept in sorted order.
pub fn canonical_source_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    let mut kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    kept.sort();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.set_fragment(None);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(if path.is_empty() { "/" } else { &path });
    Some(url.to_string())
}

fn fold_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperienceRange {
    pub min_years: Option<u32>,
    pub max_years: Option<u32>,
}

impl ExperienceRange {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn new(min_years: Option<u32>, max_years: Option<u32>) -> Self {
        Self {
            min_years,
            max_years,
        }
    }

    pub fn is_known(&self) -> bool {
        self.min_years.is_some()
    }

    pub fn level(&self) -> ExperienceLevel {
        ExperienceLevel::from_min_years(self.min_years)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceLevel {
    Entry,
    Mid,
    Senior,
    Unknown,
}

impl ExperienceLevel {
    pub fn from_min_years(min_years: Option<u32>) -> Self {
        match min_years {
            None => Self::Unknown,
            Some(0..=2) => Self::Entry,
            Some(3..=7) => Self::Mid,
            Some(_) => Self::Senior,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Mid => "mid",
            Self::Senior => "senior",
            Self::Unknown => "unknown",
        }
    }
}

/// Annual compensation range in whole currency units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: Option<String>,
    pub disclosed: bool,
}

impl SalaryRange {
    pub fn undisclosed() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityName {
    pub name: String,
    /// `true` when the alias table had no entry and `name` is the cleaned input.
    pub unmapped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SkillToken {
    pub name: String,
    /// `None` for free-form overflow tokens outside the vocabulary.
    pub category: Option<String>,
}

impl SkillToken {
    pub fn vocabulary(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: Some(category.into()),
        }
    }

    pub fn overflow(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
        }
    }
}

/// Canonical, analysis-ready job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub identity_key: IdentityKey,
    pub title: String,
    pub company: Option<String>,
    pub city: Option<CityName>,
    pub experience: ExperienceRange,
    pub salary: SalaryRange,
    pub posted_on: Option<NaiveDate>,
    /// Sorted by name, unique by name.
    pub skills: Vec<SkillToken>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

impl JobPosting {
    pub fn skill_associations(&self) -> Vec<SkillAssociation> {
        self.skills
            .iter()
            .map(|token| SkillAssociation {
                identity_key: self.identity_key.clone(),
                skill: token.name.clone(),
                category: token.category.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillAssociation {
    pub identity_key: IdentityKey,
    pub skill: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    SkippedUnchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Partial,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRunStatus(pub String);

impl fmt::Display for UnknownRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown run status `{}`", self.0)
    }
}

impl std::error::Error for UnknownRunStatus {}

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "ok" => Ok(Self::Ok),
            "partial" => Ok(Self::Partial),
            "aborted" => Ok(Self::Aborted),
            other => Err(UnknownRunStatus(other.to_string())),
        }
    }
}

/// One entry per pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRunLog {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub pages_requested: u32,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
    pub pages_empty: u32,
    pub fetch_retries: u32,
    pub records_extracted: u32,
    pub records_inserted: u32,
    pub records_updated: u32,
    pub records_skipped_duplicate: u32,
    pub records_skipped_invalid: u32,
    pub error_count: u32,
}

impl ScrapeRunLog {
    pub fn open(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            pages_requested: 0,
            pages_succeeded: 0,
            pages_failed: 0,
            pages_empty: 0,
            fetch_retries: 0,
            records_extracted: 0,
            records_inserted: 0,
            records_updated: 0,
            records_skipped_duplicate: 0,
            records_skipped_invalid: 0,
            error_count: 0,
        }
    }

    pub fn records_skipped(&self) -> u32 {
        self.records_skipped_duplicate + self.records_skipped_invalid
    }

    pub fn finalize(&mut self, status: RunStatus, finished_at: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(finished_at);
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal() && self.finished_at.is_some()
    }
}
