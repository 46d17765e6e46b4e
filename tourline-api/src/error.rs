use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tourline_core::CoreError;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    Core(CoreError),
    InternalServerError(String),
    Anyhow(anyhow::Error),
}

impl AppError {
    fn core_response(err: CoreError) -> Response {
        let (status, code) = match &err {
            CoreError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
            CoreError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
            CoreError::InsufficientCapacity { .. } => (StatusCode::CONFLICT, "insufficient_capacity"),
            CoreError::InvalidSignature => (StatusCode::BAD_REQUEST, "invalid_signature"),
            CoreError::AmountMismatch { .. } => (StatusCode::BAD_REQUEST, "amount_mismatch"),
            CoreError::AlreadyProcessed(_) => (StatusCode::OK, "already_processed"),
            CoreError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            CoreError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let body = match &err {
            CoreError::InsufficientCapacity { requested, free_seats } => json!({
                "error": err.to_string(),
                "code": code,
                "requested": requested,
                "free_seats": free_seats,
            }),
            CoreError::Unavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                json!({ "error": "Service temporarily unavailable", "code": code, "retryable": err.is_retryable() })
            }
            CoreError::InternalError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                json!({ "error": "Internal Server Error", "code": code })
            }
            _ => json!({ "error": err.to_string(), "code": code }),
        };

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Core(err) => return Self::core_response(err),
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            },
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            },
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}
