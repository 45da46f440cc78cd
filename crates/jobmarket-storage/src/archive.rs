//! Raw listing page capture, written atomically per run.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub page_index: u32,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already on disk at this path.
    pub unchanged: bool,
}

#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_dir_name(run_started_at: DateTime<Utc>) -> String {
        run_started_at.format("%Y%m%d_%H%M%S").to_string()
    }

    /// `page-NNNN.html`; the name ReplayPageSource reads back.
    pub fn page_file_name(page_index: u32) -> String {
        format!("page-{page_index:04}.html")
    }

    pub fn page_relative_path(&self, run_started_at: DateTime<Utc>, page_index: u32) -> PathBuf {
        PathBuf::from(Self::run_dir_name(run_started_at)).join(Self::page_file_name(page_index))
    }

    /// `detail-<url digest>.html`, keyed by the posting URL the detail page was fetched from.
    pub fn detail_file_name(url: &str) -> String {
        let digest = Self::sha256_hex(url.as_bytes());
        format!("detail-{}.html", &digest[..16])
    }

    pub async fn store_page(
        &self,
        run_started_at: DateTime<Utc>,
        page_index: u32,
        html: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let relative_path = self.page_relative_path(run_started_at, page_index);
        self.store_file(run_started_at, page_index, relative_path, html).await
    }

    /// Captures a posting detail page next to the listing pages of the run.
    pub async fn store_detail(
        &self,
        run_started_at: DateTime<Utc>,
        page_index: u32,
        url: &str,
        html: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let relative_path = PathBuf::from(Self::run_dir_name(run_started_at)).join(Self::detail_file_name(url));
        self.store_file(run_started_at, page_index, relative_path, html).await
    }

    async fn store_file(
        &self,
        run_started_at: DateTime<Utc>,
        page_index: u32,
        relative_path: PathBuf,
        html: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.root.join(&relative_path);
        let run_dir = self.root.join(Self::run_dir_name(run_started_at));

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating archive directory {}", run_dir.display()))?;

        let archived = |unchanged: bool| ArchivedPage {
            page_index,
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            unchanged,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading archived page {}", absolute_path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(archived(true));
            }
        }

        let temp_path = run_dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp page file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp page {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(archived(false))
    }
}
