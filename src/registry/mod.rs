//! Connection registry: the persisted state machine for each
//! (user, platform) pairing.
//!
//! The registry is the single source of truth for credential status. The
//! authorization-flow controller, the refresh sweep, and webhook ingress all
//! read and write the same rows; none of them talk to each other directly.
//! Tokens are stored as vault ciphertext only — plaintext never persists.

mod auth_state;
mod events;
mod store;

pub use auth_state::AuthState;
pub use events::WebhookEvent;
pub use store::Registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one (user, platform) connection.
///
/// ```text
/// disconnected --initiate--> pending_authorization
/// pending_authorization --callback success--> connected
/// pending_authorization --callback failure--> disconnected
/// connected --approaching expiry--> refreshing
/// refreshing --refresh success--> connected
/// refreshing --terminal failure--> needs_reauth
/// refreshing --transient failure--> connected (unchanged, retried next sweep)
/// connected/needs_reauth --explicit disconnect--> disconnected
/// needs_reauth/revoked --user re-authorizes--> pending_authorization
/// ```
///
/// `needs_reauth`, `revoked`, and `disconnected` recover only through a fresh
/// authorization cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    PendingAuthorization,
    Connected,
    Refreshing,
    NeedsReauth,
    Revoked,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::PendingAuthorization => "pending_authorization",
            Self::Connected => "connected",
            Self::Refreshing => "refreshing",
            Self::NeedsReauth => "needs_reauth",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disconnected" => Some(Self::Disconnected),
            "pending_authorization" => Some(Self::PendingAuthorization),
            "connected" => Some(Self::Connected),
            "refreshing" => Some(Self::Refreshing),
            "needs_reauth" => Some(Self::NeedsReauth),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// One registry row.
///
/// `access_token` and `refresh_token` hold vault ciphertext. A `connected`
/// row always has a non-null access token; a `needs_reauth` row always has a
/// non-null `last_error` and its tokens are unusable even if still present.
#[derive(Clone, Debug)]
pub struct PlatformConnection {
    pub user_id: String,
    pub platform: String,
    pub status: ConnectionStatus,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub provider_user_id: Option<String>,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}
