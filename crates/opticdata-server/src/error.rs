use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors that map directly to HTTP responses.
///
/// Every variant implements [`IntoResponse`] so Axum handlers can use
/// `Result<impl IntoResponse, AppError>` as their return type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Unknown or disabled site token on the public tracking surface.
    #[error("invalid token")]
    InvalidToken,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("bad domain: {0}")]
    BadDomain(String),

    /// Verification was requested before a challenge was generated.
    #[error("no dns challenge on site")]
    NoChallenge,

    /// An attribution run for the tenant is already in flight.
    #[error("attribution run in flight")]
    RunInFlight,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::InvalidToken => (
                StatusCode::NOT_FOUND,
                "invalid_token",
                "Unknown site token".to_string(),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            AppError::BadDomain(msg) => (StatusCode::BAD_REQUEST, "bad_domain", msg.clone()),
            AppError::NoChallenge => (
                StatusCode::CONFLICT,
                "no_challenge",
                "Generate a DNS challenge before verifying".to_string(),
            ),
            AppError::RunInFlight => (
                StatusCode::CONFLICT,
                "run_in_flight",
                "An attribution run for this tenant is already in flight".to_string(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message
                }
            })),
        )
            .into_response()
    }
}
