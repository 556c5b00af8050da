//! Webhook ingress endpoints.
//!
//! One POST route per platform, plus a user-scoped variant for providers
//! that cannot embed identity in their payloads. Verification runs against
//! the raw request bytes before anything is parsed; an unverified request is
//! rejected outright and produces no registry mutation and no event record.
//! A verified event whose identity matches no connection is acknowledged and
//! dropped — the provider must stop retrying, and the event simply predates
//! or postdates the connection's lifetime.

use crate::platforms::PlatformDirectory;
use crate::registry::{Registry, WebhookEvent};
use crate::webhooks::{self, CredentialAction, WebhookError, WebhookProvider};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

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
        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

/// Shared application state for webhook ingress
#[derive(Clone)]
pub struct WebhookAppState {
    pub registry: Arc<Registry>,
    pub platforms: Arc<PlatformDirectory>,
}

/// Ingress result summary returned to the provider
#[derive(Serialize)]
pub struct IngestResponse {
    pub received: usize,
    pub recorded: usize,
}

/// Create the webhook ingress router
pub fn create_webhook_router(state: WebhookAppState) -> Router {
    Router::new()
        .route("/api/webhooks/:platform", post(receive))
        .route("/api/webhooks/:platform/:user_id", post(receive_for_user))
        .with_state(Arc::new(state))
}

/// POST /api/webhooks/:platform
async fn receive(
    State(state): State<Arc<WebhookAppState>>,
    Path(platform_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    ingest(&state, &platform_id, None, &headers, &body).await
}

/// POST /api/webhooks/:platform/:user_id
///
/// Used by providers whose payloads cannot carry identity; the hook is
/// registered per user and the internal user id rides in the path.
async fn receive_for_user(
    State(state): State<Arc<WebhookAppState>>,
    Path((platform_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    ingest(&state, &platform_id, Some(user_id), &headers, &body).await
}

async fn ingest(
    state: &WebhookAppState,
    platform_id: &str,
    path_user: Option<String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    debug!(platform = %platform_id, bytes = body.len(), "Webhook delivery received");

    let provider = webhooks::provider_for(platform_id)
        .ok_or_else(|| AppError::NotFound(format!("No webhook channel for '{platform_id}'")))?;

    let secret = state
        .platforms
        .get(platform_id)
        .and_then(|p| p.webhook_secret.clone())
        .ok_or_else(|| {
            error!(platform = %platform_id, "Webhook secret not configured");
            AppError::ServerError(format!(
                "Webhook not configured for platform '{platform_id}'. Set TETHER_WEBHOOK_{}_SECRET.",
                platform_id.to_uppercase()
            ))
        })?;

    // Subscription handshake: a protocol prerequisite, answered before
    // signature verification and before any business logic
    if let Some(challenge) = provider.challenge_response(body) {
        info!(platform = %platform_id, "Answering webhook subscription challenge");
        return Ok((
            StatusCode::OK,
            [("content-type", "application/json")],
            challenge,
        )
            .into_response());
    }

    // Signature over the untouched raw body, before any JSON parsing
    if let Err(e) = provider.verify(headers, body, &secret) {
        warn!(platform = %platform_id, "Webhook signature rejected");
        return Err(match e {
            WebhookError::SignatureVerificationFailed => {
                AppError::Unauthorized("Signature verification failed".to_string())
            }
            WebhookError::MalformedPayload(msg) => AppError::BadRequest(msg),
        });
    }

    let events = provider.parse(headers, body).map_err(|e| match e {
        WebhookError::MalformedPayload(msg) => {
            warn!(platform = %platform_id, reason = %msg, "Webhook payload malformed");
            AppError::BadRequest(msg)
        }
        WebhookError::SignatureVerificationFailed => {
            AppError::Unauthorized("Signature verification failed".to_string())
        }
    })?;

    let received = events.len();
    let mut recorded = 0;

    for event in events {
        match process_event(state, provider, platform_id, path_user.as_deref(), &event) {
            Ok(true) => recorded += 1,
            Ok(false) => {}
            Err(e) => {
                // One bad event must not fail the delivery; the provider
                // would retry everything
                error!(platform = %platform_id, error = %e, "Failed to process webhook event");
            }
        }
    }

    Ok((StatusCode::OK, Json(IngestResponse { received, recorded })).into_response())
}

/// Returns `Ok(true)` when the event was recorded for the first time.
fn process_event(
    state: &WebhookAppState,
    provider: &dyn WebhookProvider,
    platform_id: &str,
    path_user: Option<&str>,
    event: &webhooks::ProviderEvent,
) -> anyhow::Result<bool> {
    // Resolve the event to an internal user
    let user_id = if provider.identity_in_path() {
        match path_user {
            Some(user) => match state.registry.get(user, platform_id)? {
                Some(_) => user.to_string(),
                None => {
                    debug!(platform = %platform_id, user_id = %user, "No connection for path identity, dropping event");
                    return Ok(false);
                }
            },
            None => {
                debug!(platform = %platform_id, "Path-identified platform called without a user id, dropping event");
                return Ok(false);
            }
        }
    } else {
        let Some(provider_uid) = event.provider_user_id.as_deref() else {
            debug!(platform = %platform_id, "Event carries no provider user id, dropping");
            return Ok(false);
        };
        match state
            .registry
            .find_by_provider_user_id(platform_id, provider_uid)?
        {
            Some(connection) => connection.user_id,
            None => {
                // Not an error: the event predates or postdates a connection
                debug!(
                    platform = %platform_id,
                    provider_user_id = %provider_uid,
                    "No matching connection, dropping event"
                );
                return Ok(false);
            }
        }
    };

    let record = WebhookEvent {
        platform: platform_id.to_string(),
        resource_id: event.resource_id.clone(),
        event_type: event.event_type.clone(),
        user_id: Some(user_id.clone()),
        provider_user_id: event.provider_user_id.clone(),
    };

    // Idempotency: a provider-side retry of the same notification records
    // nothing and triggers nothing
    if !state.registry.record_webhook_event(&record)? {
        debug!(
            platform = %platform_id,
            resource_id = %event.resource_id,
            "Duplicate delivery, already recorded"
        );
        return Ok(false);
    }

    info!(
        platform = %platform_id,
        user_id = %user_id,
        resource_id = %event.resource_id,
        event_type = %event.event_type,
        "Webhook event recorded"
    );

    // The only credential mutations ingress ever performs
    if let Some(action) = &event.action {
        match action {
            CredentialAction::Disconnect => {
                state.registry.mark_disconnected(&user_id, platform_id)?;
                info!(platform = %platform_id, user_id = %user_id, "Connection disconnected by provider event");
            }
            CredentialAction::NeedsReauth(reason) => {
                state.registry.mark_needs_reauth(&user_id, platform_id, reason)?;
                info!(platform = %platform_id, user_id = %user_id, "Connection demoted by provider event");
            }
            CredentialAction::Revoke(reason) => {
                state.registry.mark_revoked(&user_id, platform_id, reason)?;
                info!(platform = %platform_id, user_id = %user_id, "Connection revoked by provider event");
            }
        }
    }

    Ok(true)
}
