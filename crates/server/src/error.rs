use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::DbErr;
use services::services::apply::ApplyError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            // Every apply failure is retryable from the sender's point of
            // view, so the whole class maps to 5xx.
            ApiError::Apply(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ApplyError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
        };

        if status_code.is_server_error() {
            tracing::error!(
                status = %status_code,
                error_type,
                error = %self,
                "sync request failed"
            );
        }

        let response = ApiResponse::<()>::error(&self.to_string());
        (status_code, Json(response)).into_response()
    }
}
