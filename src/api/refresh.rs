//! Refresh sweep entrypoint.
//!
//! The sweep is driven by an external scheduler (typically cron) POSTing
//! here with a shared-secret bearer credential. The service never runs its
//! own refresh loop, so horizontally replicated instances do not race each
//! other on a timer they each own.

use crate::auth::extract_bearer_token;
use crate::refresh::{RefreshSweeper, SweepSummary};
use crate::webhooks::verify::constant_time_eq;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared application state for the sweep endpoint
#[derive(Clone)]
pub struct RefreshAppState {
    pub sweeper: Arc<RefreshSweeper>,
    /// Shared secret the external trigger must present
    pub sweep_secret: String,
}

/// Create the refresh trigger router
pub fn create_refresh_router(state: RefreshAppState) -> Router {
    Router::new()
        .route("/api/refresh/run", post(run_sweep))
        .with_state(Arc::new(state))
}

/// POST /api/refresh/run
async fn run_sweep(
    State(state): State<Arc<RefreshAppState>>,
    headers: HeaderMap,
) -> Result<Json<SweepSummary>, Response> {
    let presented = extract_bearer_token(&headers).map_err(|e| {
        warn!(error = %e, "Sweep trigger without credential");
        unauthorized()
    })?;

    if !constant_time_eq(presented.as_bytes(), state.sweep_secret.as_bytes()) {
        warn!("Sweep trigger with wrong credential");
        return Err(unauthorized());
    }

    info!("Refresh sweep triggered");
    let summary = state.sweeper.run_sweep().await;
    Ok(Json(summary))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Invalid sweep credential".to_string(),
        }),
    )
        .into_response()
}
