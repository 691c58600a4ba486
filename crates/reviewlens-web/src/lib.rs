//! HTTP surface: submit a job, poll its status, fetch its result, and
//! read the latest stored analysis directly.
//!
//! Everything is JSON with camelCase keys. Clients are expected to poll
//! `/api/jobs/status/{id}`; there is no push channel.

use std::net::SocketAddr;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use reviewlens_core::{CompositeAnalysis, Job, JobOptions, JobStatus, StoreKind};
use reviewlens_pipeline::{Pipeline, SubmitError, SubmitKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reviewlens-web";

pub fn router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs/analyze", post(submit_job))
        .route("/api/jobs/status/{id}", get(job_status))
        .route("/api/jobs/result/{id}", get(job_result))
        .route("/api/jobs/app/{app_id}", get(jobs_for_app))
        .route("/api/analysis/summary/{app_id}", get(analysis_summary))
        .with_state(pipeline)
}

pub async fn serve(pipeline: Pipeline, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(pipeline))
        .await
        .context("http server stopped")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Error mapping

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match &err {
            SubmitError::InvalidApp(_) => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            SubmitError::InsufficientCredit { .. } | SubmitError::UnknownAccount(_) => {
                Self::new(StatusCode::PAYMENT_REQUIRED, err.to_string())
            }
            SubmitError::Ledger(_) | SubmitError::Cache(_) => {
                warn!(error = %err, "submission failed internally");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request and response shapes

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    app_id: String,
    /// Account to bill. Absent means an anonymous, unbilled submission.
    account_id: Option<String>,
    #[serde(default)]
    force_refresh: bool,
    #[serde(default)]
    options: AnalyzeOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOptions {
    country: Option<String>,
    page_size: Option<u32>,
    max_pages: Option<u32>,
    use_pagination: Option<bool>,
    per_page_save: Option<bool>,
}

impl AnalyzeOptions {
    fn into_job_options(self) -> JobOptions {
        let defaults = JobOptions::default();
        JobOptions {
            country: self.country.unwrap_or(defaults.country),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            max_pages: self.max_pages.unwrap_or(defaults.max_pages),
            use_pagination: self.use_pagination.unwrap_or(defaults.use_pagination),
            per_page_save: self.per_page_save.unwrap_or(defaults.per_page_save),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobView {
    job_id: Uuid,
    app_id: String,
    store: StoreKind,
    status: JobStatus,
    progress: u8,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<CompositeAnalysis>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobView {
    /// Full view: the result rides along once the job completed.
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            app_id: job.app_id.clone(),
            store: job.store,
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
            error: job.error.clone(),
            result: match job.status {
                JobStatus::Completed => job.result.clone(),
                _ => None,
            },
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }

    /// Listing view: same fields minus the (potentially large) result.
    fn summary(job: &Job) -> Self {
        Self {
            result: None,
            ..Self::from_job(job)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    success: bool,
    job: JobView,
    cached: bool,
    deduplicated: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultResponse {
    job_id: Uuid,
    status: JobStatus,
    result: CompositeAnalysis,
}

// ---------------------------------------------------------------------------
// Handlers

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn submit_job(
    State(pipeline): State<Pipeline>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let outcome = pipeline
        .submit(
            request.account_id.as_deref(),
            &request.app_id,
            request.options.into_job_options(),
            request.force_refresh,
        )
        .await?;

    Ok(Json(SubmitResponse {
        success: true,
        job: JobView::from_job(&outcome.job),
        cached: outcome.kind == SubmitKind::CacheHit,
        deduplicated: outcome.kind == SubmitKind::Deduplicated,
    }))
}

async fn job_status(
    State(pipeline): State<Pipeline>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = pipeline
        .manager
        .get(id)
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;
    Ok(Json(JobView::from_job(&job)))
}

async fn job_result(
    State(pipeline): State<Pipeline>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResultResponse>, ApiError> {
    let job = pipeline
        .manager
        .get(id)
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;

    match (job.status, job.result) {
        (JobStatus::Completed, Some(result)) => Ok(Json(ResultResponse {
            job_id: job.id,
            status: job.status,
            result,
        })),
        (JobStatus::Failed, _) => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            job.error.unwrap_or_else(|| "job failed".to_string()),
        )),
        _ => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("job {id} is not completed yet"),
        )),
    }
}

async fn jobs_for_app(
    State(pipeline): State<Pipeline>,
    Path(app_id): Path<String>,
) -> Json<Vec<JobView>> {
    let views = pipeline
        .manager
        .jobs_for_app(&app_id)
        .iter()
        .map(JobView::summary)
        .collect();
    Json(views)
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    store: Option<String>,
}

fn parse_store(raw: &str) -> Option<StoreKind> {
    match raw.to_ascii_lowercase().as_str() {
        "apple" | "ios" | "appstore" => Some(StoreKind::Apple),
        "google" | "android" | "play" => Some(StoreKind::GooglePlay),
        _ => None,
    }
}

/// Latest stored analysis for an app, independent of any job. With no
/// `store` query we try both stores and return whichever has data.
async fn analysis_summary(
    State(pipeline): State<Pipeline>,
    Path(app_id): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<CompositeAnalysis>, ApiError> {
    let stores: Vec<StoreKind> = match query.store.as_deref() {
        Some(raw) => vec![parse_store(raw).ok_or_else(|| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("unknown store {raw:?}"))
        })?],
        None => vec![StoreKind::Apple, StoreKind::GooglePlay],
    };

    for store in stores {
        let found = pipeline
            .analysis_store()
            .get_latest(&app_id, store)
            .await
            .map_err(|err| {
                warn!(error = %err, app_id, "analysis read failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            })?;
        if let Some(analysis) = found {
            return Ok(Json(analysis));
        }
    }

    Err(ApiError::not_found(format!(
        "no stored analysis for {app_id}"
    )))
}
