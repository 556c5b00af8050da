//! OAuth 2.0 authorization flow for platform connections.
//!
//! Implements the authorization code flow:
//! 1. Dashboard calls GET /api/connections/:platform/authorize
//! 2. End user approves on the provider's site
//! 3. Provider redirects to /api/connections/:platform/callback
//! 4. Callback consumes the single-use state, exchanges the code, seals the
//!    tokens, and moves the registry row to "connected"
//! 5. End user is redirected back to where they started
//!
//! Failures surface to the end user only as low-detail `?error=` codes on
//! the redirect; raw provider error bodies never leave this module.

pub mod exchange;

use crate::auth::extract_bearer_token;
use crate::platforms::PlatformDirectory;
use crate::registry::Registry;
use crate::vault::TokenVault;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for OAuth endpoints
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Shared application state for the authorization flow
#[derive(Clone)]
pub struct OAuthAppState {
    pub registry: Arc<Registry>,
    pub vault: Arc<TokenVault>,
    pub platforms: Arc<PlatformDirectory>,
    pub http: reqwest::Client,
    pub auth_enabled: bool,
    pub callback_base_url: String,
    pub state_ttl_seconds: i64,
}

#[derive(Deserialize)]
pub struct BeginParams {
    return_to: Option<String>,
}

/// Begin-authorization response
#[derive(Serialize)]
pub struct BeginAuthorizationResponse {
    pub authorization_url: String,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Create the authorization-flow router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/api/connections/:platform/authorize", get(begin_authorization))
        .route("/api/connections/:platform/callback", get(complete_authorization))
        .with_state(Arc::new(state))
}

/// GET /api/connections/:platform/authorize
///
/// Mints a single-use state token, moves the registry row to
/// `pending_authorization`, and returns the provider authorization URL.
///
/// # Security
/// - Requires bearer token (user identity comes from the token)
/// - State parameter has a short TTL and is consumed exactly once
async fn begin_authorization(
    State(state): State<Arc<OAuthAppState>>,
    Path(platform_id): Path<String>,
    Query(params): Query<BeginParams>,
    headers: HeaderMap,
) -> Result<Json<BeginAuthorizationResponse>, AppError> {
    debug!(platform = %platform_id, "Authorization start requested");

    let platform = state.platforms.get(&platform_id).ok_or_else(|| {
        warn!(platform = %platform_id, "Unknown platform");
        AppError::NotFound(format!("Platform '{platform_id}' not found"))
    })?;

    // Identify the calling user
    let user_id = if state.auth_enabled {
        extract_bearer_token(&headers)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {e}")))?
    } else {
        "default".to_string()
    };

    let credentials = platform.credentials.as_ref().ok_or_else(|| {
        error!(platform = %platform_id, "Platform OAuth credentials not configured");
        AppError::ServerError(format!(
            "OAuth not configured for platform '{platform_id}'. Set TETHER_OAUTH_{}_CLIENT_ID and TETHER_OAUTH_{}_CLIENT_SECRET environment variables.",
            platform_id.to_uppercase(),
            platform_id.to_uppercase()
        ))
    })?;

    let state_token = state
        .registry
        .create_auth_state(
            &user_id,
            &platform_id,
            params.return_to.as_deref(),
            chrono::Duration::seconds(state.state_ttl_seconds),
        )
        .map_err(|e| {
            error!(platform = %platform_id, error = %e, "Failed to mint authorization state");
            AppError::ServerError("Failed to start authorization".to_string())
        })?;

    state
        .registry
        .mark_pending(&user_id, &platform_id)
        .map_err(|e| {
            error!(platform = %platform_id, error = %e, "Failed to update connection");
            AppError::ServerError("Failed to start authorization".to_string())
        })?;

    let redirect_uri = callback_url(&state.callback_base_url, &platform_id);
    let authorization_url = platform.build_auth_url(&credentials.client_id, &state_token, &redirect_uri);

    info!(
        platform = %platform_id,
        user_id = %user_id,
        "Authorization flow started"
    );

    Ok(Json(BeginAuthorizationResponse { authorization_url }))
}

/// GET /api/connections/:platform/callback
///
/// Provider redirect target. Consumes the state token (the single CSRF and
/// replay defense), exchanges the code, seals both tokens, and upserts the
/// registry row to `connected`.
async fn complete_authorization(
    State(state): State<Arc<OAuthAppState>>,
    Path(platform_id): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Response, AppError> {
    debug!(platform = %platform_id, "Authorization callback received");

    let state_token = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    // Validate and consume the state. A replayed or expired token fails
    // here and nothing else runs.
    let auth_state = state
        .registry
        .consume_auth_state(&state_token)
        .map_err(|e| {
            error!(error = %e, "Failed to consume authorization state");
            AppError::ServerError("Authorization state lookup failed".to_string())
        })?
        .ok_or_else(|| {
            warn!(platform = %platform_id, "Invalid or expired authorization state");
            AppError::Unauthorized(
                "Invalid or expired authorization state (possible CSRF attack)".to_string(),
            )
        })?;

    if auth_state.platform != platform_id {
        error!(
            expected = %auth_state.platform,
            actual = %platform_id,
            "Platform mismatch in authorization callback"
        );
        return Err(AppError::BadRequest("Platform mismatch".to_string()));
    }

    let user_id = auth_state.user_id;
    let return_target = auth_state.return_target.unwrap_or_else(|| "/".to_string());

    // User declined, or the provider reported an authorization error
    if let Some(provider_error) = callback.error {
        warn!(
            platform = %platform_id,
            user_id = %user_id,
            error = %provider_error,
            description = %callback.error_description.unwrap_or_default(),
            "Provider reported authorization failure"
        );
        record_failure(&state.registry, &user_id, &platform_id, "authorization denied");
        return Ok(error_redirect(&return_target, "denied"));
    }

    let Some(code) = callback.code else {
        record_failure(&state.registry, &user_id, &platform_id, "callback missing code");
        return Ok(error_redirect(&return_target, "invalid_callback"));
    };

    let Some(platform) = state.platforms.get(&platform_id) else {
        return Err(AppError::NotFound(format!(
            "Platform '{platform_id}' not found"
        )));
    };
    let Some(credentials) = platform.credentials.as_ref() else {
        record_failure(&state.registry, &user_id, &platform_id, "platform not configured");
        return Ok(error_redirect(&return_target, "server_error"));
    };

    // Exchange the code. Never retried: a used authorization code cannot be
    // exchanged twice.
    let redirect_uri = callback_url(&state.callback_base_url, &platform_id);
    let grant = match exchange::exchange_code(&state.http, platform, credentials, &code, &redirect_uri)
        .await
    {
        Ok(grant) => grant,
        Err(e) => {
            warn!(
                platform = %platform_id,
                user_id = %user_id,
                reason = %e.reason(),
                "Code exchange failed"
            );
            record_failure(&state.registry, &user_id, &platform_id, &e.reason());
            return Ok(error_redirect(&return_target, "exchange_failed"));
        }
    };

    // Seal both tokens; plaintext is dropped at the end of this scope
    let sealed = seal_grant(&state.vault, &grant);
    let (access_sealed, refresh_sealed) = match sealed {
        Ok(pair) => pair,
        Err(e) => {
            error!(platform = %platform_id, error = %e, "Failed to seal tokens");
            record_failure(&state.registry, &user_id, &platform_id, "credential sealing failed");
            return Ok(error_redirect(&return_target, "server_error"));
        }
    };

    if let Err(e) = state.registry.connect(
        &user_id,
        &platform_id,
        &access_sealed,
        refresh_sealed.as_deref(),
        grant.expires_at,
        grant.provider_user_id.as_deref(),
    ) {
        error!(platform = %platform_id, error = %e, "Failed to store connection");
        return Ok(error_redirect(&return_target, "server_error"));
    }

    info!(
        platform = %platform_id,
        user_id = %user_id,
        has_refresh_token = refresh_sealed.is_some(),
        expires_at = ?grant.expires_at,
        "Authorization flow completed"
    );

    Ok(success_redirect(&return_target, &platform_id))
}

fn seal_grant(
    vault: &TokenVault,
    grant: &exchange::TokenGrant,
) -> Result<(String, Option<String>), crate::vault::VaultError> {
    let access = vault.seal(&grant.access_token)?;
    let refresh = grant
        .refresh_token
        .as_deref()
        .map(|t| vault.seal(t))
        .transpose()?;
    Ok((access, refresh))
}

fn record_failure(registry: &Registry, user_id: &str, platform: &str, reason: &str) {
    if let Err(e) = registry.fail_authorization(user_id, platform, reason) {
        error!(platform = %platform, error = %e, "Failed to record authorization failure");
    }
}

fn callback_url(base_url: &str, platform: &str) -> String {
    format!("{base_url}/api/connections/{platform}/callback")
}

fn success_redirect(target: &str, platform: &str) -> Response {
    Redirect::temporary(&append_query(target, "connected", platform)).into_response()
}

fn error_redirect(target: &str, code: &str) -> Response {
    Redirect::temporary(&append_query(target, "error", code)).into_response()
}

fn append_query(target: &str, key: &str, value: &str) -> String {
    let separator = if target.contains('?') { '&' } else { '?' };
    format!(
        "{target}{separator}{key}={}",
        urlencoding::encode(value)
    )
}

/// Background task that reaps authorization states the callback never
/// consumed. Expired states are already rejected at read time; this keeps
/// the table from accumulating abandoned rows.
pub async fn run_state_purge(registry: Arc<Registry>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match registry.purge_expired_auth_states() {
            Ok(purged) if purged > 0 => {
                debug!(purged, "Reaped expired authorization states");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Authorization state purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        // Success case
        let query = "code=auth_code_123&state=csrf_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("csrf_state_456".to_string()));
        assert_eq!(callback.error, None);

        // Error case
        let query = "state=csrf_state_456&error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(callback.error_description, Some("User cancelled".to_string()));
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_append_query() {
        assert_eq!(
            append_query("/dashboard", "connected", "spotify"),
            "/dashboard?connected=spotify"
        );
        assert_eq!(
            append_query("/dashboard?tab=links", "error", "denied"),
            "/dashboard?tab=links&error=denied"
        );
        // Values are encoded
        assert_eq!(
            append_query("/d", "error", "a b"),
            "/d?error=a%20b"
        );
    }

    #[test]
    fn test_callback_url_shape() {
        assert_eq!(
            callback_url("http://localhost:3000", "strava"),
            "http://localhost:3000/api/connections/strava/callback"
        );
    }
}
