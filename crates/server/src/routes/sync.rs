use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, State, rejection::JsonRejection},
};
use db::events::SyncEnvelope;
use serde::Serialize;
use services::services::apply::ApplyOutcome;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Serialize)]
pub struct SyncAck {
    pub status: &'static str,
}

/// `POST /sync`: applies one envelope. Duplicates answer 200 as well; the
/// sender treats any 200 as delivered and a 5xx as "retry next tick".
/// Malformed bodies are a 400, never retried into success.
pub async fn receive_sync(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    payload: Result<Json<SyncEnvelope>, JsonRejection>,
) -> Result<Json<ApiResponse<SyncAck>>, ApiError> {
    let Json(envelope) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;

    let outcome = state
        .apply
        .process_envelope(&envelope, Some(peer.ip()))
        .await?;

    let status = match outcome {
        ApplyOutcome::Applied => "applied",
        ApplyOutcome::Duplicate => "duplicate",
    };
    Ok(Json(ApiResponse::success(SyncAck { status })))
}
