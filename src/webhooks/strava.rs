//! Strava push channel.
//!
//! Signature: `X-Strava-Signature`, hex HMAC-SHA256 over the raw body.
//! Subscription setup sends a one-time challenge in the body that must be
//! echoed back before anything else. Athlete updates with
//! `updates.authorized = "false"` are deauthorizations.

use super::verify::{constant_time_eq, hmac_sha256};
use super::{id_string, CredentialAction, ProviderEvent, WebhookError, WebhookProvider};
use axum::http::HeaderMap;
use serde_json::Value;

pub struct StravaWebhook;

impl WebhookProvider for StravaWebhook {
    fn platform(&self) -> &'static str {
        "strava"
    }

    fn challenge_response(&self, raw_body: &[u8]) -> Option<String> {
        let value: Value = serde_json::from_slice(raw_body).ok()?;
        let challenge = value.get("hub.challenge")?.as_str()?;
        Some(serde_json::json!({ "hub.challenge": challenge }).to_string())
    }

    fn verify(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        let signature = headers
            .get("x-strava-signature")
            .and_then(|v| v.to_str().ok())
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
        _headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<Vec<ProviderEvent>, WebhookError> {
        let value: Value = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let object_type = value
            .get("object_type")
            .and_then(Value::as_str)
            .ok_or_else(|| WebhookError::MalformedPayload("missing object_type".into()))?;
        let object_id = value
            .get("object_id")
            .and_then(id_string)
            .ok_or_else(|| WebhookError::MalformedPayload("missing object_id".into()))?;
        let aspect_type = value
            .get("aspect_type")
            .and_then(Value::as_str)
            .ok_or_else(|| WebhookError::MalformedPayload("missing aspect_type".into()))?;
        let owner_id = value
            .get("owner_id")
            .and_then(id_string)
            .ok_or_else(|| WebhookError::MalformedPayload("missing owner_id".into()))?;

        // An athlete update carrying authorized=false is the user pulling
        // the plug on the provider's side
        let deauthorized = object_type == "athlete"
            && value
                .pointer("/updates/authorized")
                .and_then(Value::as_str)
                == Some("false");

        Ok(vec![ProviderEvent {
            resource_id: format!("{object_type}/{object_id}"),
            event_type: aspect_type.to_string(),
            provider_user_id: Some(owner_id),
            action: deauthorized.then_some(CredentialAction::Disconnect),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_headers(secret: &str, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let sig = hex::encode(hmac_sha256(secret.as_bytes(), body));
        headers.insert("x-strava-signature", sig.parse().unwrap());
        headers
    }

    #[test]
    fn test_challenge_echo() {
        let body = br#"{"hub.mode":"subscribe","hub.challenge":"15f7d1a91c1f40f8a748fd134752feb3","hub.verify_token":"tether"}"#;
        let response = StravaWebhook.challenge_response(body).unwrap();
        assert_eq!(
            response,
            r#"{"hub.challenge":"15f7d1a91c1f40f8a748fd134752feb3"}"#
        );
    }

    #[test]
    fn test_regular_event_is_not_a_challenge() {
        let body = br#"{"object_type":"activity","object_id":1,"aspect_type":"create","owner_id":9}"#;
        assert!(StravaWebhook.challenge_response(body).is_none());
    }

    #[test]
    fn test_verify_roundtrip() {
        let body = br#"{"object_type":"activity","object_id":1}"#;
        let headers = signed_headers("wh-secret", body);
        assert!(StravaWebhook.verify(&headers, body, "wh-secret").is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = br#"{"object_type":"activity","object_id":1}"#;
        let headers = signed_headers("wh-secret", body);
        let tampered = br#"{"object_type":"activity","object_id":2}"#;
        assert!(matches!(
            StravaWebhook.verify(&headers, tampered, "wh-secret"),
            Err(WebhookError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_missing_signature_rejected() {
        let body = br#"{}"#;
        assert!(matches!(
            StravaWebhook.verify(&HeaderMap::new(), body, "wh-secret"),
            Err(WebhookError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_parse_activity_update() {
        let body = br#"{"aspect_type":"update","object_type":"activity","object_id":1360128428,"owner_id":134815,"subscription_id":120475,"updates":{"title":"Morning run"}}"#;
        let events = StravaWebhook.parse(&HeaderMap::new(), body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource_id, "activity/1360128428");
        assert_eq!(events[0].event_type, "update");
        assert_eq!(events[0].provider_user_id.as_deref(), Some("134815"));
        assert!(events[0].action.is_none());
    }

    #[test]
    fn test_parse_deauthorization() {
        let body = br#"{"aspect_type":"update","object_type":"athlete","object_id":134815,"owner_id":134815,"updates":{"authorized":"false"}}"#;
        let events = StravaWebhook.parse(&HeaderMap::new(), body).unwrap();
        assert_eq!(events[0].action, Some(CredentialAction::Disconnect));
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert!(StravaWebhook.parse(&HeaderMap::new(), b"not json").is_err());
        assert!(StravaWebhook.parse(&HeaderMap::new(), br#"{"x":1}"#).is_err());
    }
}
