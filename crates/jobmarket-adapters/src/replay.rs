use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobmarket_storage::{FetchError, FetchedPage, PageArchive, PageSource};
use tracing::debug;

/// Serves pages previously captured by [`PageArchive`] from one run directory.
#[derive(Debug, Clone)]
pub struct ReplayPageSource {
    dir: PathBuf,
}

impl ReplayPageSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, page_index: u32) -> PathBuf {
        self.dir.join(PageArchive::page_file_name(page_index))
    }

    /// Number of contiguous captured pages starting at page 1.
    pub fn page_count(&self) -> u32 {
        let mut count = 0;
        while self.page_path(count + 1).is_file() {
            count += 1;
        }
        count
    }

    pub fn detail_path(&self, url: &str) -> PathBuf {
        self.dir.join(PageArchive::detail_file_name(url))
    }

    async fn read_capture(&self, page_index: u32, path: PathBuf, url: String) -> Result<FetchedPage, FetchError> {
        match tokio::fs::read_to_string(&path).await {
            Ok(html) if !html.trim().is_empty() => {
                debug!(page = page_index, path = %path.display(), bytes = html.len(), "replaying captured page");
                Ok(FetchedPage {
                    page_index,
                    url,
                    status: 200,
                    html,
                    fetched_at: Utc::now(),
                    attempts: 1,
                    retry_wait: Duration::ZERO,
                })
            }
            Ok(_) => Err(FetchError::Terminal {
                page_index,
                url,
                status: None,
                message: "captured page is empty".to_string(),
            }),
            Err(err) => Err(FetchError::Terminal {
                page_index,
                url,
                status: None,
                message: format!("reading captured page: {err}"),
            }),
        }
    }
}

#[async_trait]
impl PageSource for ReplayPageSource {
    async fn fetch_page(&self, page_index: u32) -> Result<FetchedPage, FetchError> {
        let path = self.page_path(page_index);
        let url = path.display().to_string();
        self.read_capture(page_index, path, url).await
    }

    /// Served only when the original run archived the detail page.
    async fn fetch_detail(&self, page_index: u32, url: &str) -> Result<FetchedPage, FetchError> {
        self.read_capture(page_index, self.detail_path(url), url.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmarket_storage::FetchErrorKind;

    #[tokio::test]
    async fn replays_pages_in_archive_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("page-0001.html"), "<html>one</html>").expect("write capture");
        std::fs::write(dir.path().join("page-0002.html"), "<html>two</html>").expect("write capture");
        std::fs::write(dir.path().join("page-0004.html"), "<html>four</html>").expect("write capture");

        let source = ReplayPageSource::new(dir.path());
        assert_eq!(source.page_count(), 2);

        let page = source.fetch_page(2).await.expect("fetch page");
        assert_eq!(page.html, "<html>two</html>");
        assert_eq!(page.retries(), 0);

        let err = source.fetch_page(3).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Terminal);
        assert_eq!(err.page_index(), 3);
    }

    #[tokio::test]
    async fn replays_detail_pages_by_posting_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://www.naukri.com/job-listings-data-analyst-150324500123";
        std::fs::write(dir.path().join(PageArchive::detail_file_name(url)), "<html>detail</html>")
            .expect("write detail");

        let source = ReplayPageSource::new(dir.path());
        let page = source.fetch_detail(1, url).await.expect("captured detail");
        assert_eq!(page.html, "<html>detail</html>");
        assert_eq!(page.url, url);

        let err = source
            .fetch_detail(1, "https://www.naukri.com/job-listings-never-captured-1")
            .await
            .expect_err("uncaptured detail");
        assert_eq!(err.kind(), FetchErrorKind::Terminal);
    }
}
