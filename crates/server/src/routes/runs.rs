use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use docflow_core::{AnalysisRequest, RunContext, StageName};
use orchestrator::{DocumentUpload, RunReport};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct SubmitQuery {
    /// Document file name; the format is taken from its extension unless
    /// `format` is given.
    pub name: Option<String>,
    pub format: Option<String>,
    /// Predefined analysis type, e.g. `financial-summary`.
    pub analysis_type: Option<String>,
    /// Free-form analysis prompt.
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitResponse {
    pub run_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RunSummary {
    pub id: Uuid,
    pub document: String,
    pub status: String,
    #[schema(value_type = Option<String>)]
    pub current_stage: Option<StageName>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&RunContext> for RunSummary {
    fn from(ctx: &RunContext) -> Self {
        Self {
            id: ctx.id,
            document: ctx.document.name.clone(),
            status: ctx.status.label(),
            current_stage: ctx
                .current_stage
                .and_then(|i| StageName::ALL.get(i).copied()),
            created_at: ctx.created_at,
            finished_at: ctx.finished_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CancelQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelResponse {
    /// False when the run had already ended or was already cancelled.
    pub cancelled: bool,
}

#[utoipa::path(
    post,
    path = "/api/runs",
    params(SubmitQuery),
    request_body(content = Vec<u8>, description = "Raw document bytes", content_type = "application/octet-stream"),
    responses(
        (status = 202, description = "Run accepted", body = SubmitResponse),
        (status = 400, description = "Missing name or analysis request"),
        (status = 413, description = "Document too large"),
        (status = 415, description = "Unsupported document format"),
    ),
    tag = "runs"
)]
pub async fn submit_run(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let upload = match (query.name, query.format) {
        (Some(name), Some(format)) => DocumentUpload::new(name, format, body.to_vec()),
        (Some(name), None) => DocumentUpload::from_file_name(name, body.to_vec()),
        (None, Some(format)) => {
            DocumentUpload::new(format!("document.{}", format), format, body.to_vec())
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "a document name or format is required".to_string(),
            ))
        }
    };
    let request = AnalysisRequest {
        analysis_type: query.analysis_type.filter(|s| !s.trim().is_empty()),
        prompt: query.prompt,
    };

    let run_id = state.orchestrator.submit(upload, request)?;
    let status = state.orchestrator.snapshot(run_id)?.status.label();
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { run_id, status })))
}

#[utoipa::path(
    get,
    path = "/api/runs",
    responses(
        (status = 200, description = "Known runs, newest first", body = Vec<RunSummary>)
    ),
    tag = "runs"
)]
pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunSummary>> {
    let runs = state
        .orchestrator
        .runs()
        .iter()
        .map(|ctx| RunSummary::from(ctx.as_ref()))
        .collect();
    Json(runs)
}

#[utoipa::path(
    get,
    path = "/api/runs/{id}",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Current run snapshot", body = RunContext),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Arc<RunContext>>, AppError> {
    Ok(Json(state.orchestrator.snapshot(id)?))
}

#[utoipa::path(
    get,
    path = "/api/runs/{id}/result",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Finished run", body = RunContext),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run still in progress")
    ),
    tag = "runs"
)]
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Arc<RunContext>>, AppError> {
    Ok(Json(state.orchestrator.result(id)?))
}

#[utoipa::path(
    get,
    path = "/api/runs/{id}/report",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Markdown run report", body = String, content_type = "text/markdown"),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run still in progress")
    ),
    tag = "runs"
)]
pub async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = state.orchestrator.result(id)?;
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        RunReport::render(&ctx),
    ))
}

#[utoipa::path(
    get,
    path = "/api/runs/{id}/files/{name}",
    params(
        ("id" = Uuid, Path, description = "Run ID"),
        ("name" = String, Path, description = "Produced file path, relative to the run's working directory")
    ),
    responses(
        (status = 200, description = "File contents", content_type = "application/octet-stream"),
        (status = 404, description = "Run or file not found"),
        (status = 409, description = "Run still in progress")
    ),
    tag = "runs"
)]
pub async fn get_file(
    State(state): State<AppState>,
    Path((id, name)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = state.orchestrator.result(id)?;
    let file = ctx
        .execution
        .as_ref()
        .and_then(|execution| execution.file(&name))
        .ok_or_else(|| AppError::NotFound(format!("File not found: {}", name)))?;

    let bytes = match (&file.content, &file.reference) {
        (Some(content), _) => content.clone(),
        (None, Some(path)) => tokio::fs::read(path).await.map_err(|e| {
            tracing::warn!(run_id = %id, file = %name, error = %e, "Retained file unreadable");
            AppError::NotFound(format!("File no longer available: {}", name))
        })?,
        (None, None) => {
            return Err(AppError::Internal(format!(
                "File has neither content nor reference: {}",
                name
            )))
        }
    };

    let disposition = format!("attachment; filename=\"{}\"", name.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

#[utoipa::path(
    post,
    path = "/api/runs/{id}/cancel",
    params(("id" = Uuid, Path, description = "Run ID"), CancelQuery),
    responses(
        (status = 200, description = "Cancellation outcome", body = CancelResponse),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<CancelResponse>, AppError> {
    let reason = query.reason.unwrap_or_else(|| "cancelled via api".to_string());
    let cancelled = state.orchestrator.cancel(id, reason)?;
    Ok(Json(CancelResponse { cancelled }))
}

#[utoipa::path(
    delete,
    path = "/api/runs/{id}",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 204, description = "Run and its event history dropped"),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run still in progress")
    ),
    tag = "runs"
)]
pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.orchestrator.forget(id)?;
    Ok(StatusCode::NO_CONTENT)
}
