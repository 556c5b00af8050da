//! Proactive token refresh.
//!
//! One sweep per invocation, driven by an external trigger (cron hitting the
//! refresh endpoint) rather than a loop this module owns. Candidates are
//! refreshed independently: one platform's outage can never block another
//! user's refresh, and the sweep always finishes and reports even if every
//! candidate fails. Provider calls inherit the bounded timeout of the shared
//! HTTP client, so a hung endpoint costs one candidate at most that long.

use crate::api::oauth::exchange;
use crate::platforms::PlatformDirectory;
use crate::registry::{PlatformConnection, Registry};
use crate::vault::TokenVault;
use chrono::{Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of one sweep, returned to the trigger and persisted to the audit
/// log.
#[derive(Clone, Debug, Serialize)]
pub struct SweepSummary {
    pub checked: u64,
    pub refreshed: u64,
    pub failed: u64,
    pub duration_ms: u64,
}

enum CandidateOutcome {
    Refreshed,
    Failed(String),
}

/// Executes refresh sweeps over the registry.
pub struct RefreshSweeper {
    registry: Arc<Registry>,
    vault: Arc<TokenVault>,
    platforms: Arc<PlatformDirectory>,
    http: reqwest::Client,
    lookahead: Duration,
}

impl RefreshSweeper {
    pub fn new(
        registry: Arc<Registry>,
        vault: Arc<TokenVault>,
        platforms: Arc<PlatformDirectory>,
        http: reqwest::Client,
        lookahead: Duration,
    ) -> Self {
        Self {
            registry,
            vault,
            platforms,
            http,
            lookahead,
        }
    }

    /// Runs one sweep: refresh every connected, refreshable credential that
    /// expires inside the lookahead window.
    ///
    /// Never fails: per-candidate errors demote or skip that candidate only,
    /// and a failure to append the audit row is logged and swallowed.
    pub async fn run_sweep(&self) -> SweepSummary {
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        // Connections that issued no refresh token cannot be kept alive;
        // once expired they need the user again
        match self.registry.demote_expired_unrefreshable(started_at) {
            Ok(demoted) if demoted > 0 => {
                info!(demoted, "Expired unrefreshable connections demoted");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to demote expired connections"),
        }

        let candidates = match self.registry.list_expiring_before(started_at + self.lookahead) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to list refresh candidates");
                let summary = SweepSummary {
                    checked: 0,
                    refreshed: 0,
                    failed: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                self.record(started_at, &summary, Some("candidate listing failed"));
                return summary;
            }
        };

        let checked = candidates.len() as u64;
        debug!(candidates = checked, "Refresh sweep starting");

        let outcomes = join_all(
            candidates
                .into_iter()
                .map(|candidate| self.refresh_one(candidate)),
        )
        .await;

        let refreshed = outcomes
            .iter()
            .filter(|o| matches!(o, CandidateOutcome::Refreshed))
            .count() as u64;
        let failures: Vec<&str> = outcomes
            .iter()
            .filter_map(|o| match o {
                CandidateOutcome::Failed(reason) => Some(reason.as_str()),
                CandidateOutcome::Refreshed => None,
            })
            .collect();

        let summary = SweepSummary {
            checked,
            refreshed,
            failed: failures.len() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let error_summary = if failures.is_empty() {
            None
        } else {
            // First few distinct failure classes are enough for the audit row
            let mut classes: Vec<&str> = Vec::new();
            for reason in failures.iter().copied() {
                if !classes.contains(&reason) {
                    classes.push(reason);
                    if classes.len() == 3 {
                        break;
                    }
                }
            }
            Some(classes.join("; "))
        };

        info!(
            checked = summary.checked,
            refreshed = summary.refreshed,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Refresh sweep finished"
        );

        self.record(started_at, &summary, error_summary.as_deref());
        summary
    }

    async fn refresh_one(&self, candidate: PlatformConnection) -> CandidateOutcome {
        let user_id = &candidate.user_id;
        let platform_id = &candidate.platform;

        let Some(platform) = self.platforms.get(platform_id) else {
            warn!(platform = %platform_id, "Refresh candidate for unknown platform");
            return CandidateOutcome::Failed("unknown platform".to_string());
        };
        let Some(credentials) = platform.credentials.as_ref() else {
            warn!(platform = %platform_id, "Refresh candidate for unconfigured platform");
            return CandidateOutcome::Failed("platform not configured".to_string());
        };

        // list_expiring_before only returns rows with a refresh token
        let Some(sealed_refresh) = candidate.refresh_token.as_deref() else {
            return CandidateOutcome::Failed("missing refresh token".to_string());
        };

        // A credential we can no longer decrypt is terminal: only a fresh
        // authorization cycle can replace it
        let refresh_token = match self.vault.open(sealed_refresh) {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    platform = %platform_id,
                    error = %e,
                    "Refresh token ciphertext unusable"
                );
                self.demote(user_id, platform_id, "corrupt credential");
                return CandidateOutcome::Failed("corrupt credential".to_string());
            }
        };

        match self.registry.mark_refreshing(user_id, platform_id) {
            Ok(true) => {}
            Ok(false) => {
                // A callback or disconnect got there first; their write wins
                debug!(user_id = %user_id, platform = %platform_id, "Candidate changed state, skipping");
                return CandidateOutcome::Failed("superseded by a concurrent write".to_string());
            }
            Err(e) => {
                error!(error = %e, "Failed to mark connection refreshing");
                return CandidateOutcome::Failed("registry write failed".to_string());
            }
        }

        match exchange::refresh_grant(&self.http, platform, credentials, &refresh_token).await {
            Ok(grant) => self.store_refreshed(user_id, platform_id, &grant),
            Err(e) if e.is_terminal() => {
                info!(
                    user_id = %user_id,
                    platform = %platform_id,
                    reason = %e.reason(),
                    "Refresh grant is dead, demoting connection"
                );
                self.demote(user_id, platform_id, &e.reason());
                CandidateOutcome::Failed(e.reason())
            }
            Err(e) => {
                // Transient: leave the row connected and let a later sweep
                // pick it up again
                debug!(
                    user_id = %user_id,
                    platform = %platform_id,
                    reason = %e.reason(),
                    "Transient refresh failure"
                );
                if let Err(revert_err) = self.registry.revert_to_connected(user_id, platform_id) {
                    error!(error = %revert_err, "Failed to revert connection after transient failure");
                }
                CandidateOutcome::Failed(e.reason())
            }
        }
    }

    fn store_refreshed(
        &self,
        user_id: &str,
        platform_id: &str,
        grant: &exchange::TokenGrant,
    ) -> CandidateOutcome {
        let access_sealed = match self.vault.seal(&grant.access_token) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!(error = %e, "Failed to seal refreshed access token");
                let _ = self.registry.revert_to_connected(user_id, platform_id);
                return CandidateOutcome::Failed("credential sealing failed".to_string());
            }
        };
        // Only rotated refresh tokens replace the stored one
        let refresh_sealed = match grant.refresh_token.as_deref() {
            Some(token) => match self.vault.seal(token) {
                Ok(sealed) => Some(sealed),
                Err(e) => {
                    error!(error = %e, "Failed to seal rotated refresh token");
                    let _ = self.registry.revert_to_connected(user_id, platform_id);
                    return CandidateOutcome::Failed("credential sealing failed".to_string());
                }
            },
            None => None,
        };

        match self.registry.complete_refresh(
            user_id,
            platform_id,
            &access_sealed,
            refresh_sealed.as_deref(),
            grant.expires_at,
        ) {
            Ok(true) => {
                debug!(user_id = %user_id, platform = %platform_id, "Credential refreshed");
                CandidateOutcome::Refreshed
            }
            Ok(false) => {
                debug!(user_id = %user_id, platform = %platform_id, "Refresh superseded, dropping result");
                CandidateOutcome::Failed("superseded by a concurrent write".to_string())
            }
            Err(e) => {
                error!(error = %e, "Failed to store refreshed credential");
                CandidateOutcome::Failed("registry write failed".to_string())
            }
        }
    }

    fn demote(&self, user_id: &str, platform_id: &str, reason: &str) {
        if let Err(e) = self.registry.mark_needs_reauth(user_id, platform_id, reason) {
            error!(
                user_id = %user_id,
                platform = %platform_id,
                error = %e,
                "Failed to demote connection"
            );
        }
    }

    fn record(&self, started_at: chrono::DateTime<Utc>, summary: &SweepSummary, errors: Option<&str>) {
        // Audit logging must never fail the sweep
        if let Err(e) = self.registry.record_refresh_run(
            started_at,
            summary.duration_ms,
            summary.checked,
            summary.refreshed,
            summary.failed,
            errors,
        ) {
            error!(error = %e, "Failed to record refresh run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::{ClientCredentials, Platform};
    use crate::registry::ConnectionStatus;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use std::collections::BTreeMap;

    fn test_vault() -> TokenVault {
        TokenVault::new(&BASE64.encode([0u8; 32])).unwrap()
    }

    fn test_platform(token_url: &str) -> Platform {
        Platform {
            id: "spotify".to_string(),
            auth_url: "http://127.0.0.1:1/authorize".to_string(),
            token_url: token_url.to_string(),
            scopes: vec!["user-top-read".to_string()],
            extra_auth_params: BTreeMap::new(),
            identity_pointer: None,
            credentials: Some(ClientCredentials {
                client_id: "cid".to_string(),
                client_secret: "csecret".to_string(),
            }),
            webhook_secret: None,
        }
    }

    fn sweeper(token_url: &str) -> RefreshSweeper {
        let registry = Arc::new(Registry::open(":memory:").unwrap());
        let vault = Arc::new(test_vault());
        let platforms = Arc::new(PlatformDirectory::from_entries(vec![test_platform(
            token_url,
        )]));
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap();
        RefreshSweeper::new(registry, vault, platforms, http, Duration::minutes(10))
    }

    #[tokio::test]
    async fn test_empty_sweep() {
        let sweeper = sweeper("http://127.0.0.1:1/token");
        let summary = sweeper.run_sweep().await;
        assert_eq!(summary.checked, 0);
        assert_eq!(summary.refreshed, 0);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_corrupt_refresh_token_demotes_without_provider_call() {
        let sweeper = sweeper("http://127.0.0.1:1/token");
        let access = sweeper.vault.seal("access-plain").unwrap();

        // Stored ciphertext that no key can open
        sweeper
            .registry
            .connect(
                "user1",
                "spotify",
                &access,
                Some("not-a-sealed-token"),
                Some(Utc::now() + Duration::minutes(2)),
                None,
            )
            .unwrap();

        let summary = sweeper.run_sweep().await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.refreshed, 0);
        assert_eq!(summary.failed, 1);

        let row = sweeper.registry.get("user1", "spotify").unwrap().unwrap();
        assert_eq!(row.status, ConnectionStatus::NeedsReauth);
        assert_eq!(row.last_error.as_deref(), Some("corrupt credential"));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transient() {
        // Nothing listens on port 1 — the call fails at connect time
        let sweeper = sweeper("http://127.0.0.1:1/token");
        let access = sweeper.vault.seal("access-plain").unwrap();
        let refresh = sweeper.vault.seal("refresh-plain").unwrap();

        sweeper
            .registry
            .connect(
                "user1",
                "spotify",
                &access,
                Some(&refresh),
                Some(Utc::now() + Duration::minutes(2)),
                None,
            )
            .unwrap();

        let summary = sweeper.run_sweep().await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.refreshed, 0);
        assert_eq!(summary.failed, 1);

        // Transient failure leaves the row connected for the next sweep
        let row = sweeper.registry.get("user1", "spotify").unwrap().unwrap();
        assert_eq!(row.status, ConnectionStatus::Connected);
        assert_eq!(row.access_token.as_deref(), Some(access.as_str()));
    }

    #[tokio::test]
    async fn test_demoted_candidate_leaves_later_sweeps() {
        let sweeper = sweeper("http://127.0.0.1:1/token");
        let access = sweeper.vault.seal("access-plain").unwrap();

        sweeper
            .registry
            .connect(
                "user1",
                "spotify",
                &access,
                Some("garbage"),
                Some(Utc::now() + Duration::minutes(2)),
                None,
            )
            .unwrap();

        let first = sweeper.run_sweep().await;
        assert_eq!(first.checked, 1);

        // The demoted row is excluded from the next sweep's candidates
        let second = sweeper.run_sweep().await;
        assert_eq!(second.checked, 0);
    }
}
