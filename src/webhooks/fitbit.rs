//! Fitbit subscriber notifications.
//!
//! Signature: `X-Fitbit-Signature`, base64 HMAC-SHA1 keyed with
//! `client_secret + "&"` — the one legacy scheme in the directory. The body
//! is a JSON array of collection notifications; `userRevokedAccess` means
//! the user revoked the grant from their Fitbit account settings.

use super::verify::{constant_time_eq, hmac_sha1};
use super::{CredentialAction, ProviderEvent, WebhookError, WebhookProvider};
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;

pub struct FitbitWebhook;

impl WebhookProvider for FitbitWebhook {
    fn platform(&self) -> &'static str {
        "fitbit"
    }

    fn verify(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        let signature = headers
            .get("x-fitbit-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(WebhookError::SignatureVerificationFailed)?;

        let key = format!("{secret}&");
        let expected = BASE64.encode(hmac_sha1(key.as_bytes(), raw_body));
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
        let notifications = value
            .as_array()
            .ok_or_else(|| WebhookError::MalformedPayload("expected an array".into()))?;

        notifications
            .iter()
            .map(|n| {
                let collection = n
                    .get("collectionType")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        WebhookError::MalformedPayload("missing collectionType".into())
                    })?;
                let owner = n
                    .get("ownerId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| WebhookError::MalformedPayload("missing ownerId".into()))?;
                let date = n.get("date").and_then(Value::as_str).unwrap_or("-");

                let action = (collection == "userRevokedAccess")
                    .then(|| CredentialAction::Revoke("access revoked by user".to_string()));

                Ok(ProviderEvent {
                    resource_id: format!("{owner}/{date}"),
                    event_type: collection.to_string(),
                    provider_user_id: Some(owner.to_string()),
                    action,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "fitbit-client-secret";

    fn signed_headers(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let sig = BASE64.encode(hmac_sha1(format!("{SECRET}&").as_bytes(), body));
        headers.insert("x-fitbit-signature", sig.parse().unwrap());
        headers
    }

    #[test]
    fn test_verify_roundtrip() {
        let body = br#"[{"collectionType":"activities","date":"2026-08-07","ownerId":"GGNJL9","subscriptionId":"1"}]"#;
        let headers = signed_headers(body);
        assert!(FitbitWebhook.verify(&headers, body, SECRET).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"[]"#;
        let headers = signed_headers(body);
        assert!(FitbitWebhook.verify(&headers, body, "other-secret").is_err());
    }

    #[test]
    fn test_missing_signature_rejected() {
        assert!(matches!(
            FitbitWebhook.verify(&HeaderMap::new(), br#"[]"#, SECRET),
            Err(WebhookError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_parse_collection_notifications() {
        let body = br#"[
            {"collectionType":"activities","date":"2026-08-07","ownerId":"GGNJL9","subscriptionId":"1"},
            {"collectionType":"sleep","date":"2026-08-07","ownerId":"GGNJL9","subscriptionId":"1"}
        ]"#;
        let events = FitbitWebhook.parse(&HeaderMap::new(), body).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].resource_id, "GGNJL9/2026-08-07");
        assert_eq!(events[0].event_type, "activities");
        assert_eq!(events[1].event_type, "sleep");
        assert!(events.iter().all(|e| e.action.is_none()));
    }

    #[test]
    fn test_parse_revocation() {
        let body = br#"[{"collectionType":"userRevokedAccess","date":"2026-08-07","ownerId":"GGNJL9","subscriptionId":"1"}]"#;
        let events = FitbitWebhook.parse(&HeaderMap::new(), body).unwrap();
        assert_eq!(
            events[0].action,
            Some(CredentialAction::Revoke("access revoked by user".to_string()))
        );
    }

    #[test]
    fn test_parse_non_array_rejected() {
        assert!(FitbitWebhook.parse(&HeaderMap::new(), br#"{"a":1}"#).is_err());
    }
}
