//! Connection status API endpoints.
//!
//! The owning dashboard reads per-user connection status here and offers
//! explicit disconnect. Token ciphertext never appears in any response.

use crate::auth::extract_bearer_token;
use crate::platforms::PlatformDirectory;
use crate::registry::{ConnectionStatus, PlatformConnection, Registry};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

/// Shared application state for the connections API
#[derive(Clone)]
pub struct ConnectionAppState {
    pub registry: Arc<Registry>,
    pub platforms: Arc<PlatformDirectory>,
    pub auth_enabled: bool,
}

/// Per-platform connection summary (never carries token material)
#[derive(Serialize, Clone, Debug)]
pub struct ConnectionSummary {
    pub platform: String,
    /// Whether OAuth credentials are configured for this deployment
    pub enabled: bool,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Serialize)]
pub struct ListConnectionsResponse {
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

/// Create the connections API router
pub fn create_connection_router(state: ConnectionAppState) -> Router {
    Router::new()
        .route("/api/connections", get(list_connections))
        .route("/api/connections/:platform", delete(disconnect))
        .with_state(Arc::new(state))
}

/// GET /api/connections
///
/// One summary per known platform, whether or not the caller has ever
/// linked it.
async fn list_connections(
    State(state): State<Arc<ConnectionAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListConnectionsResponse>, AppError> {
    let user_id = caller(&state, &headers)?;
    debug!(user_id = %user_id, "Listing connections");

    let rows = state.registry.list_for_user(&user_id).map_err(|e| {
        warn!(error = %e, "Failed to list connections");
        AppError::ServerError("Failed to list connections".to_string())
    })?;

    let connections = state
        .platforms
        .ids()
        .into_iter()
        .map(|platform_id| {
            let row = rows.iter().find(|r| r.platform == platform_id);
            let enabled = state
                .platforms
                .get(platform_id)
                .is_some_and(|p| p.credentials.is_some());
            summarize(platform_id, enabled, row)
        })
        .collect();

    Ok(Json(ListConnectionsResponse { connections }))
}

/// DELETE /api/connections/:platform
///
/// Explicit disconnect: tokens are dropped immediately, and only a fresh
/// authorization cycle brings the platform back.
async fn disconnect(
    State(state): State<Arc<ConnectionAppState>>,
    Path(platform_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let user_id = caller(&state, &headers)?;

    if !state.platforms.is_known(&platform_id) {
        return Err(AppError::NotFound(format!(
            "Platform '{platform_id}' not found"
        )));
    }

    let disconnected = state
        .registry
        .mark_disconnected(&user_id, &platform_id)
        .map_err(|e| {
            warn!(error = %e, "Failed to disconnect");
            AppError::ServerError("Failed to disconnect".to_string())
        })?;

    if !disconnected {
        return Err(AppError::NotFound(format!(
            "No '{platform_id}' connection for this user"
        )));
    }

    info!(user_id = %user_id, platform = %platform_id, "Connection disconnected");
    Ok(Json(DisconnectResponse { success: true }))
}

fn caller(state: &ConnectionAppState, headers: &HeaderMap) -> Result<String, AppError> {
    if state.auth_enabled {
        extract_bearer_token(headers)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {e}")))
    } else {
        Ok("default".to_string())
    }
}

fn summarize(platform: &str, enabled: bool, row: Option<&PlatformConnection>) -> ConnectionSummary {
    match row {
        Some(row) => ConnectionSummary {
            platform: platform.to_string(),
            enabled,
            status: row.status,
            expires_at: row.expires_at,
            connected_at: row.connected_at,
            last_error: row.last_error.clone(),
        },
        None => ConnectionSummary {
            platform: platform.to_string(),
            enabled,
            status: ConnectionStatus::Disconnected,
            expires_at: None,
            connected_at: None,
            last_error: None,
        },
    }
}
