//! SQLite persistence for the connection registry.
//!
//! All four stores (connections, authorization states, webhook events,
//! refresh audit) live in one database so a deployment has exactly one
//! stateful artifact.
//!
//! # Concurrency
//! Every mutation is a single conditional UPDATE (or upsert) keyed by the
//! (user_id, platform) unique constraint, so concurrent writers can never
//! interleave into a half-written row. Transition methods return `false`
//! when the guard did not match — the caller lost a race, re-reads once,
//! and either re-applies or accepts the newer write.
//!
//! # Thread safety
//! The connection is wrapped in a Mutex; SQLite itself is ACID, so partial
//! updates are never observable.

use super::{ConnectionStatus, PlatformConnection};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

const CONNECTION_COLUMNS: &str = "user_id, platform, status, access_token, refresh_token, \
     expires_at, provider_user_id, last_error, connected_at, updated_at, disconnected_at";

/// Registry over a single SQLite database.
pub struct Registry {
    pub(super) conn: Mutex<Connection>,
}

impl Registry {
    /// Creates or opens the registry database, creating the schema if needed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open registry database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                status TEXT NOT NULL,
                access_token TEXT,
                refresh_token TEXT,
                expires_at TEXT,
                provider_user_id TEXT,
                last_error TEXT,
                connected_at TEXT,
                updated_at TEXT NOT NULL,
                disconnected_at TEXT,
                UNIQUE(user_id, platform)
            );
            CREATE INDEX IF NOT EXISTS idx_connections_expiry
                ON connections(status, expires_at);
            CREATE INDEX IF NOT EXISTS idx_connections_provider_uid
                ON connections(platform, provider_user_id);

            CREATE TABLE IF NOT EXISTS auth_states (
                state_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                return_target TEXT,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS webhook_events (
                id INTEGER PRIMARY KEY,
                platform TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                user_id TEXT,
                provider_user_id TEXT,
                received_at TEXT NOT NULL,
                UNIQUE(platform, resource_id, event_type)
            );

            CREATE TABLE IF NOT EXISTS refresh_runs (
                id INTEGER PRIMARY KEY,
                started_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                checked INTEGER NOT NULL,
                refreshed INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                error_summary TEXT
            );
            "#,
        )
        .context("Failed to create registry schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Retrieves one connection row.
    pub fn get(&self, user_id: &str, platform: &str) -> Result<Option<PlatformConnection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONNECTION_COLUMNS} FROM connections WHERE user_id = ?1 AND platform = ?2"
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![user_id, platform])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(read_connection(row)?)),
            None => Ok(None),
        }
    }

    /// Moves a row to `pending_authorization`, creating it if absent.
    ///
    /// This is the "initiate" edge: any previously stored tokens are cleared,
    /// since the credential is no longer trusted once a fresh authorization
    /// cycle starts.
    pub fn mark_pending(&self, user_id: &str, platform: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO connections (user_id, platform, status, updated_at)
                VALUES (?1, ?2, 'pending_authorization', ?3)
                ON CONFLICT(user_id, platform) DO UPDATE SET
                    status = 'pending_authorization',
                    access_token = NULL,
                    refresh_token = NULL,
                    expires_at = NULL,
                    last_error = NULL,
                    updated_at = excluded.updated_at
                "#,
                params![user_id, platform, now],
            )
            .context("Failed to mark connection pending")?;
        Ok(())
    }

    /// Upserts a row to `connected` after a successful code exchange.
    ///
    /// Clears `last_error` and `disconnected_at`, stamps `connected_at`, and
    /// keeps a previously learned `provider_user_id` when the token response
    /// did not carry one.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &self,
        user_id: &str,
        platform: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        provider_user_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let expires_at = expires_at.map(|dt| dt.to_rfc3339());
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO connections (
                    user_id, platform, status, access_token, refresh_token,
                    expires_at, provider_user_id, last_error,
                    connected_at, updated_at, disconnected_at
                )
                VALUES (?1, ?2, 'connected', ?3, ?4, ?5, ?6, NULL, ?7, ?7, NULL)
                ON CONFLICT(user_id, platform) DO UPDATE SET
                    status = 'connected',
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    provider_user_id = COALESCE(excluded.provider_user_id, provider_user_id),
                    last_error = NULL,
                    connected_at = excluded.connected_at,
                    updated_at = excluded.updated_at,
                    disconnected_at = NULL
                "#,
                params![
                    user_id,
                    platform,
                    access_token,
                    refresh_token,
                    expires_at,
                    provider_user_id,
                    now,
                ],
            )
            .context("Failed to store connection")?;
        Ok(())
    }

    /// `pending_authorization` → `disconnected` after a failed or abandoned
    /// callback. The failure reason lands in `last_error`. Guarded on the
    /// pending state so a stale callback cannot demote a row a later flow
    /// already connected.
    pub fn fail_authorization(&self, user_id: &str, platform: &str, reason: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE connections SET
                    status = 'disconnected',
                    access_token = NULL,
                    refresh_token = NULL,
                    expires_at = NULL,
                    last_error = ?3,
                    disconnected_at = ?4,
                    updated_at = ?4
                WHERE user_id = ?1 AND platform = ?2 AND status = 'pending_authorization'
                "#,
                params![user_id, platform, reason, now],
            )
            .context("Failed to record authorization failure")?;
        Ok(changed > 0)
    }

    /// `connected` → `refreshing`. Returns `false` if the row was not in
    /// `connected` (a callback or disconnect won the race — skip it).
    pub fn mark_refreshing(&self, user_id: &str, platform: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE connections SET status = 'refreshing', updated_at = ?3
                 WHERE user_id = ?1 AND platform = ?2 AND status = 'connected'",
                params![user_id, platform, now],
            )
            .context("Failed to mark connection refreshing")?;
        Ok(changed > 0)
    }

    /// `refreshing` → `connected` with the freshly sealed tokens.
    ///
    /// `refresh_token` of `None` keeps the stored one (the provider did not
    /// rotate it). Returns `false` if the row left `refreshing` in the
    /// meantime; the newer write wins.
    pub fn complete_refresh(
        &self,
        user_id: &str,
        platform: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let expires_at = expires_at.map(|dt| dt.to_rfc3339());
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE connections SET
                    status = 'connected',
                    access_token = ?3,
                    refresh_token = COALESCE(?4, refresh_token),
                    expires_at = ?5,
                    last_error = NULL,
                    updated_at = ?6
                WHERE user_id = ?1 AND platform = ?2 AND status = 'refreshing'
                "#,
                params![user_id, platform, access_token, refresh_token, expires_at, now],
            )
            .context("Failed to complete refresh")?;
        Ok(changed > 0)
    }

    /// `refreshing` → `connected` without touching the credential, after a
    /// transient provider failure. The candidate re-enters a later sweep.
    pub fn revert_to_connected(&self, user_id: &str, platform: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE connections SET status = 'connected', updated_at = ?3
                 WHERE user_id = ?1 AND platform = ?2 AND status = 'refreshing'",
                params![user_id, platform, now],
            )
            .context("Failed to revert connection")?;
        Ok(changed > 0)
    }

    /// Terminal demotion: the credential is unusable until the user runs a
    /// fresh authorization cycle. `reason` lands in `last_error`.
    pub fn mark_needs_reauth(&self, user_id: &str, platform: &str, reason: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE connections SET status = 'needs_reauth', last_error = ?3, updated_at = ?4
                 WHERE user_id = ?1 AND platform = ?2
                   AND status IN ('connected', 'refreshing', 'needs_reauth')",
                params![user_id, platform, reason, now],
            )
            .context("Failed to mark connection needs_reauth")?;
        Ok(changed > 0)
    }

    /// Explicit disconnect. Tokens are dropped immediately.
    pub fn mark_disconnected(&self, user_id: &str, platform: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE connections SET
                    status = 'disconnected',
                    access_token = NULL,
                    refresh_token = NULL,
                    expires_at = NULL,
                    disconnected_at = ?3,
                    updated_at = ?3
                WHERE user_id = ?1 AND platform = ?2
                "#,
                params![user_id, platform, now],
            )
            .context("Failed to mark connection disconnected")?;
        Ok(changed > 0)
    }

    /// Provider-declared revocation (deauthorization push). Tokens are
    /// dropped; recovery requires a fresh authorization cycle.
    pub fn mark_revoked(&self, user_id: &str, platform: &str, reason: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE connections SET
                    status = 'revoked',
                    access_token = NULL,
                    refresh_token = NULL,
                    expires_at = NULL,
                    last_error = ?3,
                    updated_at = ?4
                WHERE user_id = ?1 AND platform = ?2
                "#,
                params![user_id, platform, reason, now],
            )
            .context("Failed to mark connection revoked")?;
        Ok(changed > 0)
    }

    /// Refresh-sweep candidates: `connected` rows with a refresh token whose
    /// expiry falls before `cutoff`. Rows in `needs_reauth` (or any other
    /// state) and rows that cannot be refreshed are never returned.
    pub fn list_expiring_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<PlatformConnection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                r#"
                SELECT {CONNECTION_COLUMNS} FROM connections
                WHERE status = 'connected'
                  AND refresh_token IS NOT NULL
                  AND expires_at IS NOT NULL
                  AND expires_at <= ?1
                ORDER BY expires_at
                "#
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![cutoff.to_rfc3339()])
            .context("Failed to execute query")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            out.push(read_connection(row)?);
        }
        Ok(out)
    }

    /// Demotes `connected` rows whose access token has expired and that
    /// carry no refresh token. Nothing can proactively refresh these; once
    /// dead they need a fresh authorization cycle. Returns how many rows
    /// were demoted.
    pub fn demote_expired_unrefreshable(&self, now: DateTime<Utc>) -> Result<usize> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE connections SET
                    status = 'needs_reauth',
                    last_error = 'access token expired and no refresh token issued',
                    updated_at = ?1
                WHERE status = 'connected'
                  AND refresh_token IS NULL
                  AND expires_at IS NOT NULL
                  AND expires_at <= ?1
                "#,
                params![now.to_rfc3339()],
            )
            .context("Failed to demote expired connections")?;
        Ok(changed)
    }

    /// Resolves an inbound webhook's provider-side user identifier back to a
    /// connection. Returns the first match for the platform.
    pub fn find_by_provider_user_id(
        &self,
        platform: &str,
        provider_user_id: &str,
    ) -> Result<Option<PlatformConnection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONNECTION_COLUMNS} FROM connections
                 WHERE platform = ?1 AND provider_user_id = ?2"
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![platform, provider_user_id])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(read_connection(row)?)),
            None => Ok(None),
        }
    }

    /// All connections for one user, for the status dashboard.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<PlatformConnection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONNECTION_COLUMNS} FROM connections
                 WHERE user_id = ?1 ORDER BY platform"
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![user_id])
            .context("Failed to execute query")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            out.push(read_connection(row)?);
        }
        Ok(out)
    }
}

fn read_connection(row: &rusqlite::Row<'_>) -> Result<PlatformConnection> {
    let status_raw: String = row.get(2)?;
    let status = ConnectionStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("Unknown connection status '{status_raw}'"))?;

    Ok(PlatformConnection {
        user_id: row.get(0)?,
        platform: row.get(1)?,
        status,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: parse_optional_ts(row.get(5)?)?,
        provider_user_id: row.get(6)?,
        last_error: row.get(7)?,
        connected_at: parse_optional_ts(row.get(8)?)?,
        updated_at: parse_ts(&row.get::<_, String>(9)?)?,
        disconnected_at: parse_optional_ts(row.get(10)?)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .context("Failed to parse timestamp")
}

fn parse_optional_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}
