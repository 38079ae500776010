//! Admin surface: one replay hook plus a connectivity probe. Everything
//! operational beyond these two endpoints belongs to orchestration, not to
//! this process.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

pub fn build_router(shared: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/replay", post(replay))
        .route("/v1/status", get(status))
        .with_state(shared)
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    /// Hex-encoded raw payload, exactly as originally received.
    pub payload_hex: String,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub injected: bool,
}

/// Inject a payload into the ingest buffer as if it had arrived on the
/// stream. Sentinel offset, no broker context, so the cursor is untouched.
async fn replay(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReplayRequest>,
) -> Result<Json<ReplayResponse>, (StatusCode, String)> {
    state
        .runtime
        .replay_hex(&req.payload_hex)
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    Ok(Json(ReplayResponse { injected: true }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub has_outbox_table: bool,
    pub config_hash: String,
}

async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let st = tcap_db::status(&state.pool)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    Ok(Json(StatusResponse {
        ok: st.ok,
        has_outbox_table: st.has_outbox_table,
        config_hash: state.config_hash.clone(),
    }))
}
