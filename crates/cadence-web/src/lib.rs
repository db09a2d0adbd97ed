//! Axum JSON API: work item queries, due-date updates, batch cycle time and
//! an upstream health probe.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use cadence_analytics::SchedulingService;
use cadence_core::{
    parse_day, parse_work_item_id, validate_work_item_ids, BatchResult, DateRange,
    ValidationError, WorkItem,
};
use cadence_http::UpstreamError;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cadence-web";

#[derive(Clone)]
pub struct AppState {
    pub service: SchedulingService,
}

impl AppState {
    pub fn new(service: SchedulingService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    MalformedBody(String),
    #[error("{context}")]
    Upstream {
        context: &'static str,
        #[source]
        source: UpstreamError,
    },
}

impl ApiError {
    fn upstream(context: &'static str) -> impl FnOnce(UpstreamError) -> Self {
        move |source| Self::Upstream { context, source }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) | ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream { context, source } => {
                error!(status = source.status, error = %source, "{context}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkItemsQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Distinguishes a missing `dueDate` (outer `None`) from an explicit `null`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDueDateRequest {
    #[serde(default, deserialize_with = "present")]
    pub due_date: Option<Option<String>>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleTimeRequest {
    #[serde(default)]
    pub work_item_ids: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub timestamp: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/workitems", get(work_items_handler))
        .route("/api/workitems/{id}/due-date", patch(due_date_handler))
        .route("/api/cycle-time", post(cycle_time_handler))
        .route("/api/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, tracker = state.service.tracker_id(), "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn work_items_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkItemsQuery>,
) -> Result<Json<Vec<WorkItem>>, ApiError> {
    let range = DateRange::from_bounds(query.from.as_deref(), query.to.as_deref())?;
    let items = state
        .service
        .work_items(range)
        .await
        .map_err(ApiError::upstream("Failed to fetch work items"))?;
    Ok(Json(items))
}

async fn due_date_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateDueDateRequest>, JsonRejection>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let id = parse_work_item_id(&id)?;
    let Json(request) = payload.map_err(|rejection| ApiError::MalformedBody(rejection.body_text()))?;
    let due_date = match request.due_date {
        None => return Err(ValidationError::InvalidDate.into()),
        Some(None) => None,
        Some(Some(raw)) => Some(parse_day(&raw)?),
    };

    state
        .service
        .update_due_date(id, due_date)
        .await
        .map_err(ApiError::upstream("Failed to update due date"))?;
    Ok(Json(UpdateResponse { success: true }))
}

async fn cycle_time_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CycleTimeRequest>, JsonRejection>,
) -> Result<Json<BatchResult>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::MalformedBody(rejection.body_text()))?;
    let ids = validate_work_item_ids(request.work_item_ids.as_deref().unwrap_or_default())?;
    Ok(Json(state.service.cycle_times(&ids).await))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: state.service.health().await,
        timestamp: Utc::now().to_rfc3339(),
    })
}
