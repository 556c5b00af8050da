//! WHOOP push notifications.
//!
//! Signature: `X-WHOOP-Signature`, base64 HMAC-SHA256 over
//! `timestamp || body`, with the millisecond timestamp in
//! `X-WHOOP-Signature-Timestamp`. Requests whose timestamp falls outside a
//! five-minute window are rejected as replays.

use super::verify::{constant_time_eq, hmac_sha256};
use super::{id_string, CredentialAction, ProviderEvent, WebhookError, WebhookProvider};
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde_json::Value;

/// Maximum accepted clock skew between the signed timestamp and now
const MAX_SKEW_MS: i64 = 5 * 60 * 1000;

pub struct WhoopWebhook;

impl WebhookProvider for WhoopWebhook {
    fn platform(&self) -> &'static str {
        "whoop"
    }

    fn verify(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        let signature = headers
            .get("x-whoop-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(WebhookError::SignatureVerificationFailed)?;
        let timestamp = headers
            .get("x-whoop-signature-timestamp")
            .and_then(|v| v.to_str().ok())
            .ok_or(WebhookError::SignatureVerificationFailed)?;

        // Replay window first: an old request is rejected even if its
        // signature is genuine
        let ts_ms: i64 = timestamp
            .parse()
            .map_err(|_| WebhookError::SignatureVerificationFailed)?;
        if (Utc::now().timestamp_millis() - ts_ms).abs() > MAX_SKEW_MS {
            return Err(WebhookError::SignatureVerificationFailed);
        }

        let mut signed = timestamp.as_bytes().to_vec();
        signed.extend_from_slice(raw_body);
        let expected = BASE64.encode(hmac_sha256(secret.as_bytes(), &signed));

        if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(WebhookError::SignatureVerificationFailed)
        }
    }

    fn parse(
        &self,
        _headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<Vec<ProviderEvent>, WebhookError> {
        let value: Value = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let id = value
            .get("id")
            .and_then(id_string)
            .ok_or_else(|| WebhookError::MalformedPayload("missing id".into()))?;
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| WebhookError::MalformedPayload("missing type".into()))?;
        let user_id = value
            .get("user_id")
            .and_then(id_string)
            .ok_or_else(|| WebhookError::MalformedPayload("missing user_id".into()))?;

        let action = (event_type == "user.deauthorized").then(|| {
            CredentialAction::NeedsReauth("deauthorized by provider".to_string())
        });

        Ok(vec![ProviderEvent {
            resource_id: id,
            event_type: event_type.to_string(),
            provider_user_id: Some(user_id),
            action,
        }])
    }
}
