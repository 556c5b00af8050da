//! Token-endpoint grants: authorization-code exchange and refresh.
//!
//! Both grants are form POSTs against the platform's token endpoint. The
//! error split matters to callers: a `Rejected` response with an
//! `invalid_grant`-class error is terminal (the grant is dead, only a fresh
//! authorization cycle helps), while transport failures and 5xx responses
//! are transient and safe to retry on a later sweep. Authorization codes are
//! never retried at all — a used code cannot be exchanged twice.

use crate::platforms::{ClientCredentials, Platform};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Tokens minted by a successful grant.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-side user id, when the platform's `identity_pointer` names
    /// one in the token response
    pub provider_user_id: Option<String>,
}

/// Grant failure classification.
#[derive(Debug)]
pub enum GrantError {
    /// No usable HTTP response: timeout, connect failure, body read error
    Transport(String),
    /// Non-success HTTP status from the token endpoint
    Rejected {
        status: u16,
        /// OAuth `error` field, when the response body carried one
        oauth_error: Option<String>,
    },
    /// 2xx response whose body is not a token payload
    Malformed(String),
}

impl GrantError {
    /// `true` when the grant itself is invalid or revoked and retrying can
    /// never succeed.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Rejected {
                status,
                oauth_error,
            } => {
                matches!(
                    oauth_error.as_deref(),
                    Some("invalid_grant" | "invalid_token")
                ) || matches!(status, 400 | 401 | 403)
            }
            Self::Transport(_) | Self::Malformed(_) => false,
        }
    }

    /// Short failure class for `last_error` and logs — never the raw
    /// provider body.
    pub fn reason(&self) -> String {
        match self {
            Self::Transport(_) => "provider unreachable".to_string(),
            Self::Rejected {
                status,
                oauth_error,
            } => match oauth_error {
                Some(err) => format!("provider rejected grant: {err}"),
                None => format!("provider rejected grant: HTTP {status}"),
            },
            Self::Malformed(_) => "provider returned an unusable response".to_string(),
        }
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    client: &reqwest::Client,
    platform: &Platform,
    credentials: &ClientCredentials,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenGrant, GrantError> {
    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "authorization_code");
    form_data.insert("code", code);
    form_data.insert("redirect_uri", redirect_uri);
    form_data.insert("client_id", credentials.client_id.as_str());
    form_data.insert("client_secret", credentials.client_secret.as_str());

    tracing::debug!(platform = %platform.id, "Exchanging authorization code for tokens");
    request_token(client, platform, &form_data).await
}

/// Refresh an access token with a refresh-token grant.
pub async fn refresh_grant(
    client: &reqwest::Client,
    platform: &Platform,
    credentials: &ClientCredentials,
    refresh_token: &str,
) -> Result<TokenGrant, GrantError> {
    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "refresh_token");
    form_data.insert("refresh_token", refresh_token);
    form_data.insert("client_id", credentials.client_id.as_str());
    form_data.insert("client_secret", credentials.client_secret.as_str());

    tracing::debug!(platform = %platform.id, "Requesting token refresh");
    request_token(client, platform, &form_data).await
}

async fn request_token(
    client: &reqwest::Client,
    platform: &Platform,
    form_data: &HashMap<&str, &str>,
) -> Result<TokenGrant, GrantError> {
    let response = client
        .post(&platform.token_url)
        .header("Accept", "application/json")
        .form(form_data)
        .send()
        .await
        .map_err(|e| GrantError::Transport(e.to_string()))?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| GrantError::Transport(e.to_string()))?;

    if !status.is_success() {
        // Pull the OAuth error code out if the body is JSON; the raw body
        // itself is never propagated
        let oauth_error = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from));
        return Err(GrantError::Rejected {
            status: status.as_u16(),
            oauth_error,
        });
    }

    let parsed: TokenResponse =
        serde_json::from_slice(&body).map_err(|e| GrantError::Malformed(e.to_string()))?;

    let expires_at = parsed
        .expires_in
        .map(|seconds| Utc::now() + Duration::seconds(seconds));

    let provider_user_id = platform.identity_pointer.as_deref().and_then(|pointer| {
        serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.pointer(pointer).and_then(pointer_id))
    });

    tracing::debug!(
        platform = %platform.id,
        has_refresh_token = parsed.refresh_token.is_some(),
        expires_in = ?parsed.expires_in,
        "Token grant succeeded"
    );

    Ok(TokenGrant {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at,
        provider_user_id,
    })
}

fn pointer_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
