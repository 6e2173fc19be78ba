use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::queue::InProcessQueue;
use crate::error::WorkflowError;
use crate::model::{Decision, Phase, ReviewPayload};
use crate::store::SearchOptions;
use crate::workflow::WorkflowEngine;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<WorkflowEngine>,
    queue: InProcessQueue,
}

impl AppState {
    pub fn new(engine: Arc<WorkflowEngine>, max_concurrency: usize) -> Self {
        Self {
            engine,
            queue: InProcessQueue::new(max_concurrency),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/reviews", get(list_reviews))
        .route("/reviews/:request_id", get(get_review))
        .route("/reviews/:request_id/decision", post(submit_decision))
        .route("/chapters", get(list_chapters).post(enqueue_chapter))
        .route("/chapters/:chapter_id", get(get_chapter))
        .route("/publication", get(get_publication))
        .route("/publication/book.md", get(get_publication_markdown))
        .route("/search", get(search))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body: `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Workflow(WorkflowError),
    Unprocessable(String),
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self::Workflow(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub fn status_for(err: &WorkflowError) -> StatusCode {
    match err {
        WorkflowError::NotFound { .. } => StatusCode::NOT_FOUND,
        WorkflowError::InvalidState { .. }
        | WorkflowError::AlreadyResolved { .. }
        | WorkflowError::DuplicateOpenRequest { .. } => StatusCode::CONFLICT,
        WorkflowError::AdapterTimeout { .. }
        | WorkflowError::AdapterBadOutput { .. }
        | WorkflowError::AdapterFailed { .. }
        | WorkflowError::RetryLimitExceeded { .. } => StatusCode::BAD_GATEWAY,
        WorkflowError::IncompatibleIndex { .. } | WorkflowError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Workflow(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(%err, "request failed");
                } else if err.is_misuse() {
                    tracing::debug!(%err, "request rejected");
                }
                (status, err.to_string())
            }
            Self::Unprocessable(message) => (StatusCode::UNPROCESSABLE_ENTITY, message),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

async fn list_reviews(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.pending_reviews().await?))
}

async fn get_review(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.review(&request_id).await?))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DecisionKind {
    Approve,
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    decision: DecisionKind,
    #[serde(default)]
    reenter_at: Option<Phase>,
    #[serde(default)]
    edited_content: Option<String>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    reviewer: Option<String>,
}

async fn submit_decision(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = match body.decision {
        DecisionKind::Approve => Decision::Approve,
        DecisionKind::Reject => {
            if let Some(phase) = body.reenter_at
                && !phase.is_reentry_target()
            {
                return Err(ApiError::Unprocessable(format!(
                    "reenter_at must be DRAFTED or SPUN, got {phase}"
                )));
            }
            Decision::Reject {
                reenter_at: body.reenter_at,
            }
        }
    };
    let payload = ReviewPayload {
        edited_content: body.edited_content,
        feedback: body.feedback,
        reviewer: body.reviewer,
    };
    let chapter = state
        .engine
        .submit_human_decision(&request_id, decision, payload)
        .await?;

    // A rejected chapter re-runs its pipeline in the background.
    if chapter.reentry.is_some() {
        let engine = Arc::clone(&state.engine);
        let chapter_id = chapter.id.clone();
        state.queue.spawn(async move {
            if let Err(err) = engine.run_until_suspended(&chapter_id).await {
                tracing::warn!(chapter_id = %chapter_id, %err, "re-run after rejection failed");
            }
        });
    }
    Ok(Json(chapter))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    url: String,
}

#[derive(Debug, Serialize)]
struct Enqueued {
    url: String,
    status: &'static str,
}

async fn enqueue_chapter(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<impl IntoResponse, ApiError> {
    let url = body.url.trim().to_owned();
    url::Url::parse(&url)
        .map_err(|err| ApiError::Unprocessable(format!("invalid url {url:?}: {err}")))?;

    let engine = Arc::clone(&state.engine);
    let job_url = url.clone();
    state.queue.spawn(async move {
        match engine.process(&job_url).await {
            Ok(chapter) => tracing::info!(
                url = %job_url,
                chapter_id = %chapter.id,
                state = %chapter.state(),
                "queued chapter processed"
            ),
            Err(err) => tracing::warn!(url = %job_url, %err, "queued chapter failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(Enqueued {
            url,
            status: "queued",
        }),
    ))
}

async fn list_chapters(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.list_chapters().await?))
}

async fn get_chapter(
    State(state): State<AppState>,
    Path(chapter_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.chapter_report(&chapter_id).await?))
}

async fn get_publication(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.get_book().await?))
}

async fn get_publication_markdown(State(state): State<AppState>) -> Result<Response, ApiError> {
    let markdown = state.engine.get_book().await?.render_markdown();
    let mut resp = markdown.into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/markdown; charset=utf-8"),
    );
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("inline; filename=\"book.md\""),
    );
    Ok(resp)
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    q: String,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default)]
    chapter: Option<String>,
    #[serde(default)]
    phase: Option<Phase>,
    #[serde(default)]
    min_score: Option<f32>,
}

fn default_k() -> usize {
    5
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::Unprocessable("q is required".to_owned()));
    }
    let options = SearchOptions {
        k: query.k,
        chapter_id: query.chapter,
        phase: query.phase,
        min_score: query.min_score,
    };
    Ok(Json(state.engine.search(&query.q, &options).await?))
}
