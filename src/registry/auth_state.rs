//! Single-use authorization states for CSRF protection.
//!
//! One row per outbound authorization redirect, keyed by an unguessable
//! state token that is embedded by value in the redirect URL. Consuming a
//! token deletes its row in the same transaction, so a second callback
//! presenting the same token always fails. Expiry is enforced at read time;
//! expired rows are additionally reaped by a periodic purge.

use super::Registry;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use uuid::Uuid;

/// Payload correlating an authorization callback with the request that
/// started it.
#[derive(Clone, Debug)]
pub struct AuthState {
    pub state_token: String,
    pub user_id: String,
    pub platform: String,
    pub return_target: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Registry {
    /// Mints a new authorization state with the given TTL and returns its
    /// token (UUID v4).
    pub fn create_auth_state(
        &self,
        user_id: &str,
        platform: &str,
        return_target: Option<&str>,
        ttl: Duration,
    ) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();

        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO auth_states
                     (state_token, user_id, platform, return_target, issued_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    token,
                    user_id,
                    platform,
                    return_target,
                    now.to_rfc3339(),
                    (now + ttl).to_rfc3339(),
                ],
            )
            .context("Failed to store authorization state")?;

        Ok(token)
    }

    /// Validates and consumes a state token.
    ///
    /// Returns `None` for unknown, already-consumed, or expired tokens. The
    /// row is deleted in the same transaction as the lookup (single-use).
    pub fn consume_auth_state(&self, state_token: &str) -> Result<Option<AuthState>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .context("Failed to begin transaction")?;

        let found = {
            let mut stmt = tx
                .prepare(
                    "SELECT user_id, platform, return_target, issued_at, expires_at
                     FROM auth_states WHERE state_token = ?1",
                )
                .context("Failed to prepare query")?;
            let mut rows = stmt
                .query(params![state_token])
                .context("Failed to execute query")?;

            match rows.next().context("Failed to read row")? {
                Some(row) => Some(AuthState {
                    state_token: state_token.to_string(),
                    user_id: row.get(0)?,
                    platform: row.get(1)?,
                    return_target: row.get(2)?,
                    issued_at: parse_ts(&row.get::<_, String>(3)?)?,
                    expires_at: parse_ts(&row.get::<_, String>(4)?)?,
                }),
                None => None,
            }
        };

        // Delete whether it validates or not — a presented token is spent
        tx.execute(
            "DELETE FROM auth_states WHERE state_token = ?1",
            params![state_token],
        )
        .context("Failed to consume authorization state")?;
        tx.commit().context("Failed to commit state consumption")?;

        match found {
            Some(state) if state.expires_at > Utc::now() => Ok(Some(state)),
            _ => Ok(None),
        }
    }

    /// Removes expired states that were never presented. Returns the number
    /// of rows reaped.
    pub fn purge_expired_auth_states(&self) -> Result<usize> {
        let purged = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM auth_states WHERE expires_at <= ?1",
                params![Utc::now().to_rfc3339()],
            )
            .context("Failed to purge expired authorization states")?;
        Ok(purged)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .context("Failed to parse timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Registry {
        Registry::open(":memory:").expect("Failed to create test registry")
    }

    #[test]
    fn test_create_and_consume() {
        let reg = test_registry();

        let token = reg
            .create_auth_state("user1", "spotify", Some("/dashboard"), Duration::minutes(10))
            .unwrap();
        assert!(!token.is_empty());

        let state = reg.consume_auth_state(&token).unwrap().unwrap();
        assert_eq!(state.user_id, "user1");
        assert_eq!(state.platform, "spotify");
        assert_eq!(state.return_target.as_deref(), Some("/dashboard"));
    }

    #[test]
    fn test_state_is_single_use() {
        let reg = test_registry();
        let token = reg
            .create_auth_state("user1", "strava", None, Duration::minutes(10))
            .unwrap();

        assert!(reg.consume_auth_state(&token).unwrap().is_some());
        // Second presentation of the same token fails
        assert!(reg.consume_auth_state(&token).unwrap().is_none());
    }

    #[test]
    fn test_unknown_state_rejected() {
        let reg = test_registry();
        assert!(reg.consume_auth_state("no-such-token").unwrap().is_none());
    }

    #[test]
    fn test_expired_state_rejected_at_read() {
        let reg = test_registry();
        let token = reg
            .create_auth_state("user1", "fitbit", None, Duration::seconds(-1))
            .unwrap();

        // Still physically present, but expired — rejected at read time
        assert!(reg.consume_auth_state(&token).unwrap().is_none());
    }

    #[test]
    fn test_purge_reaps_only_expired() {
        let reg = test_registry();
        let dead = reg
            .create_auth_state("user1", "spotify", None, Duration::seconds(-1))
            .unwrap();
        let live = reg
            .create_auth_state("user2", "spotify", None, Duration::minutes(10))
            .unwrap();

        assert_eq!(reg.purge_expired_auth_states().unwrap(), 1);
        assert!(reg.consume_auth_state(&dead).unwrap().is_none());
        assert!(reg.consume_auth_state(&live).unwrap().is_some());
    }
}
