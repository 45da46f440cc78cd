//! SQLite-backed job store: idempotent upserts keyed by identity, skill
//! associations, run logs and the read-only query surface.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use jobmarket_core::{
    CityName, ExperienceRange, IdentityKey, JobPosting, RunStatus, SalaryRange, ScrapeRunLog,
    SkillToken, UpsertOutcome,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("transaction failed: {0}")]
    Transaction(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if !matches!(db.kind(), sqlx::error::ErrorKind::Other) {
                return Self::ConstraintViolation(db.message().to_string());
            }
        }
        Self::Transaction(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillFrequency {
    pub skill: String,
    pub category: Option<String>,
    pub postings: i64,
}

#[derive(Debug, Clone, FromRow)]
struct PostingRow {
    identity_key: String,
    title: String,
    company: Option<String>,
    city: Option<String>,
    city_unmapped: bool,
    experience_min: Option<i64>,
    experience_max: Option<i64>,
    salary_min: Option<f64>,
    salary_max: Option<f64>,
    salary_currency: Option<String>,
    salary_disclosed: bool,
    posted_on: Option<NaiveDate>,
    source_url: Option<String>,
    description: Option<String>,
    scraped_at: DateTime<Utc>,
}

impl PostingRow {
    fn into_posting(self, skills: Vec<SkillToken>) -> JobPosting {
        JobPosting {
            identity_key: IdentityKey::from(self.identity_key),
            title: self.title,
            company: self.company,
            city: self.city.map(|name| CityName {
                name,
                unmapped: self.city_unmapped,
            }),
            experience: ExperienceRange::new(
                self.experience_min.and_then(|v| u32::try_from(v).ok()),
                self.experience_max.and_then(|v| u32::try_from(v).ok()),
            ),
            salary: SalaryRange {
                min: self.salary_min,
                max: self.salary_max,
                currency: self.salary_currency,
                disclosed: self.salary_disclosed,
            },
            posted_on: self.posted_on,
            skills,
            source_url: self.source_url,
            description: self.description,
            scraped_at: self.scraped_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct SkillRow {
    identity_key: String,
    skill: String,
    category: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct RunRow {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: String,
    pages_requested: i64,
    pages_succeeded: i64,
    pages_failed: i64,
    pages_empty: i64,
    fetch_retries: i64,
    records_extracted: i64,
    records_inserted: i64,
    records_updated: i64,
    records_skipped_duplicate: i64,
    records_skipped_invalid: i64,
    error_count: i64,
}

impl TryFrom<RunRow> for ScrapeRunLog {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let count = |v: i64| u32::try_from(v).unwrap_or(u32::MAX);
        Ok(ScrapeRunLog {
            run_id: Uuid::parse_str(&row.run_id)
                .map_err(|e| StoreError::Decode(format!("run_id {}: {e}", row.run_id)))?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status: RunStatus::from_str(&row.status).map_err(|e| StoreError::Decode(e.to_string()))?,
            pages_requested: count(row.pages_requested),
            pages_succeeded: count(row.pages_succeeded),
            pages_failed: count(row.pages_failed),
            pages_empty: count(row.pages_empty),
            fetch_retries: count(row.fetch_retries),
            records_extracted: count(row.records_extracted),
            records_inserted: count(row.records_inserted),
            records_updated: count(row.records_updated),
            records_skipped_duplicate: count(row.records_skipped_duplicate),
            records_skipped_invalid: count(row.records_skipped_invalid),
            error_count: count(row.error_count),
        })
    }
}

/// Volatile fields an existing row may take from a re-observed posting.
#[derive(Debug, Default)]
struct VolatileRefresh {
    posted_on: Option<NaiveDate>,
    salary: Option<SalaryRange>,
    description: Option<String>,
    scraped_at: Option<DateTime<Utc>>,
}

impl VolatileRefresh {
    /// An observation older than the stored row refreshes nothing.
    fn between(stored: &PostingRow, incoming: &JobPosting) -> Self {
        if incoming.scraped_at < stored.scraped_at {
            return Self::default();
        }
        Self {
            posted_on: incoming.posted_on.filter(|d| stored.posted_on != Some(*d)),
            salary: (!stored.salary_disclosed && incoming.salary.disclosed)
                .then(|| incoming.salary.clone()),
            description: incoming
                .description
                .clone()
                .filter(|d| stored.description.as_deref() != Some(d.as_str())),
            scraped_at: (incoming.scraped_at > stored.scraped_at).then_some(incoming.scraped_at),
        }
    }

    fn is_empty(&self) -> bool {
        self.posted_on.is_none()
            && self.salary.is_none()
            && self.description.is_none()
            && self.scraped_at.is_none()
    }
}

const POSTING_COLUMNS: &str = "identity_key, title, company, city, city_unmapped, \
     experience_min, experience_max, salary_min, salary_max, salary_currency, \
     salary_disclosed, posted_on, source_url, description, scraped_at";

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens (creating if needed) the database at `database_url` and applies migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "job store ready");
        Ok(store)
    }

    /// Single-connection in-memory store; the database lives as long as the pool.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Inserts a new posting or refreshes the volatile fields of an existing
    /// one. Posting row and skill rows commit together or not at all.
    pub async fn upsert(&self, posting: &JobPosting) -> Result<UpsertOutcome, StoreError> {
        let key = posting.identity_key.as_str();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {POSTING_COLUMNS} FROM job_postings WHERE identity_key = ?"
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                insert_posting(&mut tx, posting).await?;
                insert_skills(&mut tx, posting).await?;
                UpsertOutcome::Inserted
            }
            Some(stored) => {
                let refresh = VolatileRefresh::between(&stored, posting);
                let added_skills = insert_skills(&mut tx, posting).await?;
                if refresh.is_empty() && added_skills == 0 {
                    UpsertOutcome::SkippedUnchanged
                } else {
                    apply_refresh(&mut tx, key, &refresh).await?;
                    UpsertOutcome::Updated
                }
            }
        };

        tx.commit().await?;
        debug!(identity_key = key, ?outcome, "posting upserted");
        Ok(outcome)
    }

    pub async fn posting(&self, key: &IdentityKey) -> Result<Option<JobPosting>, StoreError> {
        let row = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {POSTING_COLUMNS} FROM job_postings WHERE identity_key = ?"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let skills = sqlx::query_as::<_, SkillRow>(
            "SELECT identity_key, skill, category FROM job_skills WHERE identity_key = ? ORDER BY skill",
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|s| SkillToken {
            name: s.skill,
            category: s.category,
        })
        .collect();
        Ok(Some(row.into_posting(skills)))
    }

    /// Postings last observed on or after `since` (all postings when `None`),
    /// most recently scraped first.
    pub async fn postings_since(&self, since: Option<NaiveDate>) -> Result<Vec<JobPosting>, StoreError> {
        let since = since_bound(since);
        let rows = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {POSTING_COLUMNS} FROM job_postings \
             WHERE (?1 IS NULL OR scraped_at >= ?1) \
             ORDER BY scraped_at DESC, identity_key"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let skill_rows = sqlx::query_as::<_, SkillRow>(
            "SELECT s.identity_key, s.skill, s.category FROM job_skills s \
             JOIN job_postings p ON p.identity_key = s.identity_key \
             WHERE (?1 IS NULL OR p.scraped_at >= ?1) \
             ORDER BY s.identity_key, s.skill",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut skills: HashMap<String, Vec<SkillToken>> = HashMap::new();
        for row in skill_rows {
            skills.entry(row.identity_key).or_default().push(SkillToken {
                name: row.skill,
                category: row.category,
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let tokens = skills.remove(&row.identity_key).unwrap_or_default();
                row.into_posting(tokens)
            })
            .collect())
    }

    pub async fn skill_frequencies(&self, since: Option<NaiveDate>) -> Result<Vec<SkillFrequency>, StoreError> {
        let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
            "SELECT s.skill, MAX(s.category), COUNT(*) AS postings FROM job_skills s \
             JOIN job_postings p ON p.identity_key = s.identity_key \
             WHERE (?1 IS NULL OR p.scraped_at >= ?1) \
             GROUP BY s.skill \
             ORDER BY postings DESC, s.skill ASC",
        )
        .bind(since_bound(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(skill, category, postings)| SkillFrequency {
                skill,
                category,
                postings,
            })
            .collect())
    }

    pub async fn count_postings(&self) -> Result<i64, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_postings")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_skill_associations(&self) -> Result<i64, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_skills")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Records a run as `running` so crashed runs remain visible.
    pub async fn open_run_log(&self, log: &ScrapeRunLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scrape_runs (run_id, started_at, status) VALUES (?, ?, ?) \
             ON CONFLICT(run_id) DO NOTHING",
        )
        .bind(log.run_id.to_string())
        .bind(log.started_at)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes the finalised log. A run that is already finalised is never
    /// touched again.
    pub async fn append_run_log(&self, log: &ScrapeRunLog) -> Result<(), StoreError> {
        if !log.is_finalized() {
            return Err(StoreError::ConstraintViolation(format!(
                "run {} has not been finalised",
                log.run_id
            )));
        }

        let result = sqlx::query(
            "INSERT INTO scrape_runs (run_id, started_at, finished_at, status, pages_requested, \
                 pages_succeeded, pages_failed, pages_empty, fetch_retries, records_extracted, \
                 records_inserted, records_updated, records_skipped_duplicate, \
                 records_skipped_invalid, error_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(run_id) DO UPDATE SET \
                 finished_at = excluded.finished_at, status = excluded.status, \
                 pages_requested = excluded.pages_requested, \
                 pages_succeeded = excluded.pages_succeeded, \
                 pages_failed = excluded.pages_failed, pages_empty = excluded.pages_empty, \
                 fetch_retries = excluded.fetch_retries, \
                 records_extracted = excluded.records_extracted, \
                 records_inserted = excluded.records_inserted, \
                 records_updated = excluded.records_updated, \
                 records_skipped_duplicate = excluded.records_skipped_duplicate, \
                 records_skipped_invalid = excluded.records_skipped_invalid, \
                 error_count = excluded.error_count \
             WHERE scrape_runs.status = 'running'",
        )
        .bind(log.run_id.to_string())
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.status.as_str())
        .bind(i64::from(log.pages_requested))
        .bind(i64::from(log.pages_succeeded))
        .bind(i64::from(log.pages_failed))
        .bind(i64::from(log.pages_empty))
        .bind(i64::from(log.fetch_retries))
        .bind(i64::from(log.records_extracted))
        .bind(i64::from(log.records_inserted))
        .bind(i64::from(log.records_updated))
        .bind(i64::from(log.records_skipped_duplicate))
        .bind(i64::from(log.records_skipped_invalid))
        .bind(i64::from(log.error_count))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "run {} is already finalised",
                log.run_id
            )));
        }
        Ok(())
    }

    pub async fn run_log(&self, run_id: Uuid) -> Result<Option<ScrapeRunLog>, StoreError> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM scrape_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(ScrapeRunLog::try_from)
            .transpose()
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<ScrapeRunLog>, StoreError> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM scrape_runs ORDER BY started_at DESC LIMIT ?")
            .bind(i64::from(limit.max(1)))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ScrapeRunLog::try_from)
            .collect()
    }
}

fn since_bound(since: Option<NaiveDate>) -> Option<DateTime<Utc>> {
    since.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|dt| dt.and_utc())
}

async fn insert_posting(conn: &mut SqliteConnection, posting: &JobPosting) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO job_postings (identity_key, title, company, city, city_unmapped, \
             experience_min, experience_max, salary_min, salary_max, salary_currency, \
             salary_disclosed, posted_on, source_url, description, first_seen_at, scraped_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(posting.identity_key.as_str())
    .bind(&posting.title)
    .bind(posting.company.as_deref())
    .bind(posting.city.as_ref().map(|c| c.name.as_str()))
    .bind(posting.city.as_ref().is_some_and(|c| c.unmapped))
    .bind(posting.experience.min_years.map(i64::from))
    .bind(posting.experience.max_years.map(i64::from))
    .bind(posting.salary.min)
    .bind(posting.salary.max)
    .bind(posting.salary.currency.as_deref())
    .bind(posting.salary.disclosed)
    .bind(posting.posted_on)
    .bind(posting.source_url.as_deref())
    .bind(posting.description.as_deref())
    .bind(posting.scraped_at)
    .bind(posting.scraped_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Adds skill rows not yet present; returns how many were new.
async fn insert_skills(conn: &mut SqliteConnection, posting: &JobPosting) -> Result<u64, StoreError> {
    let mut added = 0;
    for assoc in posting.skill_associations() {
        let result = sqlx::query(
            "INSERT INTO job_skills (identity_key, skill, category) VALUES (?, ?, ?) \
             ON CONFLICT(identity_key, skill) DO NOTHING",
        )
        .bind(assoc.identity_key.as_str())
        .bind(&assoc.skill)
        .bind(assoc.category.as_deref())
        .execute(&mut *conn)
        .await?;
        added += result.rows_affected();
    }
    Ok(added)
}

async fn apply_refresh(conn: &mut SqliteConnection, key: &str, refresh: &VolatileRefresh) -> Result<(), StoreError> {
    if let Some(posted_on) = refresh.posted_on {
        sqlx::query("UPDATE job_postings SET posted_on = ? WHERE identity_key = ?")
            .bind(posted_on)
            .bind(key)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(salary) = &refresh.salary {
        sqlx::query(
            "UPDATE job_postings SET salary_min = ?, salary_max = ?, salary_currency = ?, \
                 salary_disclosed = ? WHERE identity_key = ?",
        )
        .bind(salary.min)
        .bind(salary.max)
        .bind(salary.currency.as_deref())
        .bind(salary.disclosed)
        .bind(key)
        .execute(&mut *conn)
        .await?;
    }
    if let Some(description) = &refresh.description {
        sqlx::query("UPDATE job_postings SET description = ? WHERE identity_key = ?")
            .bind(description)
            .bind(key)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(scraped_at) = refresh.scraped_at {
        sqlx::query("UPDATE job_postings SET scraped_at = ? WHERE identity_key = ?")
            .bind(scraped_at)
            .bind(key)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
