pub mod error;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "docflow API",
        version = "0.1.0",
        description = "Submit documents for multi-stage analysis and follow their runs"
    ),
    paths(
        routes::health_check,
        routes::submit_run,
        routes::list_runs,
        routes::get_run,
        routes::get_result,
        routes::get_report,
        routes::get_file,
        routes::cancel_run,
        routes::delete_run,
        routes::sse::run_events,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::SubmitResponse,
        routes::RunSummary,
        routes::CancelResponse,
        error::ErrorResponse,
        docflow_core::RunContext,
        docflow_core::StageResult,
        docflow_core::RunFailure,
        docflow_core::ExecutionResult,
        docflow_core::ProducedFile,
        docflow_core::GeneratedArtifact,
        events::ProgressEvent,
        events::EventKind,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "runs", description = "Run submission and results"),
        (name = "events", description = "Real-time run progress (SSE)"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route(
            "/api/runs",
            get(routes::list_runs).post(routes::submit_run),
        )
        .route(
            "/api/runs/{id}",
            get(routes::get_run).delete(routes::delete_run),
        )
        .route("/api/runs/{id}/events", get(routes::sse::run_events))
        .route("/api/runs/{id}/result", get(routes::get_result))
        .route("/api/runs/{id}/report", get(routes::get_report))
        .route("/api/runs/{id}/files/{*name}", get(routes::get_file))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until ctrl-c, then shut the orchestrator down.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let orchestrator = state.orchestrator.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    orchestrator.shutdown();
    Ok(())
}
