//! Read-only JSON query surface over the cleaned job dataset.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use jobmarket_core::{ExperienceLevel, IdentityKey, JobPosting};
use jobmarket_storage::JobStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobmarket-web";

const DEFAULT_RUN_LIMIT: u32 = 20;
const MAX_RUN_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
}

impl AppState {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }
}

/// A posting as served: the stored record plus its derived experience level.
#[derive(Debug, Clone, Serialize)]
pub struct PostingView {
    #[serde(flatten)]
    pub posting: JobPosting,
    pub experience_level: ExperienceLevel,
}

impl From<JobPosting> for PostingView {
    fn from(posting: JobPosting) -> Self {
        Self {
            experience_level: posting.experience.level(),
            posting,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SinceQuery {
    since: Option<NaiveDate>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/postings", get(postings_handler))
        .route("/postings/{key}", get(posting_detail_handler))
        .route("/skills", get(skills_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    store: JobStore,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query surface listening");
    axum::serve(listener, app(AppState::new(store)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count_postings().await {
        Ok(postings) => Json(serde_json::json!({ "status": "ok", "postings": postings })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn postings_handler(State(state): State<Arc<AppState>>, Query(query): Query<SinceQuery>) -> Response {
    match state.store.postings_since(query.since).await {
        Ok(postings) => Json(postings.into_iter().map(PostingView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err),
    }
}

async fn posting_detail_handler(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.store.posting(&IdentityKey::from(key)).await {
        Ok(Some(posting)) => Json(PostingView::from(posting)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "posting not found" })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn skills_handler(State(state): State<Arc<AppState>>, Query(query): Query<SinceQuery>) -> Response {
    match state.store.skill_frequencies(query.since).await {
        Ok(frequencies) => Json(frequencies).into_response(),
        Err(err) => server_error(err),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match state.store.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
