//! Webhook event ledger and refresh audit log.

use super::Registry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

/// One provider change notification, as recorded by webhook ingress.
#[derive(Clone, Debug)]
pub struct WebhookEvent {
    pub platform: String,
    /// Provider-side identifier of the changed resource
    pub resource_id: String,
    pub event_type: String,
    pub user_id: Option<String>,
    pub provider_user_id: Option<String>,
}

impl Registry {
    /// Records a webhook event exactly once.
    ///
    /// The ledger is keyed by (platform, resource_id, event_type), so a
    /// provider-side retry of the same notification is a no-op. Returns
    /// `true` only for the first delivery.
    pub fn record_webhook_event(&self, event: &WebhookEvent) -> Result<bool> {
        let inserted = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR IGNORE INTO webhook_events
                     (platform, resource_id, event_type, user_id, provider_user_id, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.platform,
                    event.resource_id,
                    event.event_type,
                    event.user_id,
                    event.provider_user_id,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to record webhook event")?;
        Ok(inserted > 0)
    }

    /// Number of recorded webhook events for a platform.
    pub fn count_webhook_events(&self, platform: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM webhook_events WHERE platform = ?1",
                params![platform],
                |row| row.get(0),
            )
            .context("Failed to count webhook events")?;
        Ok(count)
    }

    /// Appends one refresh-sweep audit row. Never mutated afterward.
    pub fn record_refresh_run(
        &self,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        checked: u64,
        refreshed: u64,
        failed: u64,
        error_summary: Option<&str>,
    ) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO refresh_runs
                     (started_at, duration_ms, checked, refreshed, failed, error_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    started_at.to_rfc3339(),
                    duration_ms,
                    checked,
                    refreshed,
                    failed,
                    error_summary,
                ],
            )
            .context("Failed to record refresh run")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Registry {
        Registry::open(":memory:").expect("Failed to create test registry")
    }

    fn sample_event() -> WebhookEvent {
        WebhookEvent {
            platform: "strava".to_string(),
            resource_id: "activity/987".to_string(),
            event_type: "update".to_string(),
            user_id: Some("user1".to_string()),
            provider_user_id: Some("12345".to_string()),
        }
    }

    #[test]
    fn test_duplicate_delivery_records_once() {
        let reg = test_registry();
        let event = sample_event();

        assert!(reg.record_webhook_event(&event).unwrap());
        // Provider retry of the same notification
        assert!(!reg.record_webhook_event(&event).unwrap());
        assert_eq!(reg.count_webhook_events("strava").unwrap(), 1);
    }

    #[test]
    fn test_distinct_event_types_are_separate() {
        let reg = test_registry();
        let create = sample_event();
        let delete = WebhookEvent {
            event_type: "delete".to_string(),
            ..create.clone()
        };

        assert!(reg.record_webhook_event(&create).unwrap());
        assert!(reg.record_webhook_event(&delete).unwrap());
        assert_eq!(reg.count_webhook_events("strava").unwrap(), 2);
    }

    #[test]
    fn test_refresh_run_append() {
        let reg = test_registry();
        reg.record_refresh_run(Utc::now(), 1520, 12, 10, 2, Some("2 transient failures"))
            .unwrap();
        reg.record_refresh_run(Utc::now(), 80, 0, 0, 0, None).unwrap();
    }
}
