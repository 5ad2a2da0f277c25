use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::{OrchestratorError, ReaderError};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
    Orchestrator(OrchestratorError),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::Orchestrator(err) => {
                let message = err.to_string();
                match err {
                    OrchestratorError::RunNotFound(_) => {
                        (StatusCode::NOT_FOUND, "not_found", message)
                    }
                    OrchestratorError::NotTerminal(_) => {
                        (StatusCode::CONFLICT, "not_terminal", message)
                    }
                    OrchestratorError::InvalidRequest(_) => {
                        (StatusCode::BAD_REQUEST, "bad_request", message)
                    }
                    OrchestratorError::Rejected(reader) => match reader {
                        ReaderError::Unsupported(_) => (
                            StatusCode::UNSUPPORTED_MEDIA_TYPE,
                            "unsupported_format",
                            message,
                        ),
                        ReaderError::SizeLimit { .. } => {
                            (StatusCode::PAYLOAD_TOO_LARGE, "too_large", message)
                        }
                        ReaderError::Corrupt(_) => {
                            (StatusCode::UNPROCESSABLE_ENTITY, "corrupt_document", message)
                        }
                    },
                    OrchestratorError::ShuttingDown => {
                        (StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
                    }
                    other => {
                        tracing::error!("Orchestrator error: {:?}", other);
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
                    }
                }
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Orchestrator(err)
    }
}
