//! Page fetching, raw page archive and durable job store.

pub mod archive;
pub mod http;
pub mod store;

pub use archive::{ArchivedPage, PageArchive};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchErrorKind,
    FetchedPage, HttpClientConfig, ListingUrlTemplate, PacingPolicy, PageFetcher, PageSource,
    RateLimitConfig, ReqwestTransport, RetryDisposition, Transport, TransportError,
    TransportResponse,
};
pub use reqwest::StatusCode;
pub use store::{JobStore, SkillFrequency, StoreError};

pub const CRATE_NAME: &str = "jobmarket-storage";
