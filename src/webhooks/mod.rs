//! Provider-initiated push notifications.
//!
//! Each supporting platform gets a `WebhookProvider` implementation: verify
//! the signature over the untouched raw body, then parse the payload into
//! change events. Nothing is ever processed unverified; the only exception
//! is the subscription challenge handshake one provider requires, which is a
//! protocol prerequisite rather than a security check and carries no
//! business data.

mod fitbit;
mod github;
mod strava;
pub mod verify;
mod whoop;

pub use fitbit::FitbitWebhook;
pub use github::GithubWebhook;
pub use strava::StravaWebhook;
pub use whoop::WhoopWebhook;

use axum::http::HeaderMap;
use thiserror::Error;

/// What an event asks the registry to do with the credential, if anything.
///
/// Ingress never mutates credential status except for provider-sent
/// deauthorization events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialAction {
    /// User removed the integration on the provider's side
    Disconnect,
    /// Grant is dead; a fresh authorization cycle is required
    NeedsReauth(String),
    /// Provider named an explicit user revocation
    Revoke(String),
}

/// One change notification extracted from a verified payload.
#[derive(Clone, Debug)]
pub struct ProviderEvent {
    /// Provider-side identifier of the changed resource; part of the
    /// idempotency key
    pub resource_id: String,
    pub event_type: String,
    /// Provider-side user identifier, for platforms that embed identity in
    /// the payload. `None` for path-identified platforms.
    pub provider_user_id: Option<String>,
    pub action: Option<CredentialAction>,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    /// Missing, malformed, or wrong signature — the request is rejected
    /// before any processing
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Signature was valid but the payload does not have the provider's
    /// documented shape
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Per-provider webhook policy.
pub trait WebhookProvider: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Subscription-time URL-ownership handshake: if the raw body is a
    /// challenge request, returns the response body to echo. Answered
    /// before signature verification and before any business logic.
    fn challenge_response(&self, _raw_body: &[u8]) -> Option<String> {
        None
    }

    /// `true` for providers that cannot embed identity in the payload; the
    /// internal user id then arrives in the request path.
    fn identity_in_path(&self) -> bool {
        false
    }

    /// Verifies the signature headers against the exact raw body bytes.
    fn verify(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError>;

    /// Parses a verified body into events. Never called before `verify`.
    fn parse(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<Vec<ProviderEvent>, WebhookError>;
}

/// Looks up the webhook implementation for a platform.
pub fn provider_for(platform: &str) -> Option<&'static dyn WebhookProvider> {
    static STRAVA: StravaWebhook = StravaWebhook;
    static FITBIT: FitbitWebhook = FitbitWebhook;
    static WHOOP: WhoopWebhook = WhoopWebhook;
    static GITHUB: GithubWebhook = GithubWebhook;

    match platform {
        "strava" => Some(&STRAVA),
        "fitbit" => Some(&FITBIT),
        "whoop" => Some(&WHOOP),
        "github" => Some(&GITHUB),
        _ => None,
    }
}

/// Renders a JSON id that may arrive as either a number or a string.
pub(crate) fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
