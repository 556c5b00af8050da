//! GitHub webhooks.
//!
//! Signature: `X-Hub-Signature-256: sha256=<hex>` over the raw body. GitHub
//! payloads carry no identifier we track at token time, so these hooks are
//! registered per user and the internal user id arrives in the request path.

use super::verify::{constant_time_eq, hmac_sha256};
use super::{id_string, ProviderEvent, WebhookError, WebhookProvider};
use axum::http::HeaderMap;
use serde_json::Value;

pub struct GithubWebhook;

impl WebhookProvider for GithubWebhook {
    fn platform(&self) -> &'static str {
        "github"
    }

    fn identity_in_path(&self) -> bool {
        true
    }

    fn verify(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("sha256="))
            .ok_or(WebhookError::SignatureVerificationFailed)?;

        let expected = hex::encode(hmac_sha256(secret.as_bytes(), raw_body));
        if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(WebhookError::SignatureVerificationFailed)
        }
    }

    fn parse(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<Vec<ProviderEvent>, WebhookError> {
        let value: Value = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let event_type = headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("push")
            .to_string();

        // Pushes carry a head commit; the subscription ping carries the hook id
        let resource_id = value
            .pointer("/head_commit/id")
            .and_then(id_string)
            .or_else(|| value.get("hook_id").and_then(id_string))
            .ok_or_else(|| {
                WebhookError::MalformedPayload("missing head_commit.id or hook_id".into())
            })?;

        Ok(vec![ProviderEvent {
            resource_id,
            event_type,
            provider_user_id: None,
            action: None,
        }])
    }
}
