use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

/// Ошибки API-границы. Тела ответов всегда в форме {"detail": ...},
/// как их ожидает фронтенд.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Lock held by another operation
    #[error("{0}")]
    Conflict(String),

    /// Malformed input, missing confirmation, unknown references
    #[error("{0}")]
    Validation(String),

    /// A safety guardrail rejected the request
    #[error("{0}")]
    Guardrail(String),

    #[error("{0}")]
    NotFound(String),

    /// Store or internal failures; never corrupts lock state
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(entity: &str) -> Self {
        AppError::NotFound(format!("{} not found", entity))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Guardrail(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(err) => {
                error!("Internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
