use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{AppState, error::ApiError};

pub(crate) fn extract_sync_token(req: &Request) -> Option<&str> {
    req.headers()
        .get("x-sync-token")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Validates the shared `X-Sync-Token` header on every sync request.
pub async fn require_sync_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.config.sync_token();
    let presented = extract_sync_token(&req);

    if presented != Some(expected) {
        tracing::warn!(
            path = %req.uri().path(),
            method = %req.method(),
            reason = if presented.is_none() { "missing_token" } else { "token_mismatch" },
            "unauthorized sync request"
        );
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(req).await)
}
