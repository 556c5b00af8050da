//! Service configuration from environment variables.
//!
//! Everything is prefixed `TETHER_`. The encryption key and the sweep
//! secret are required; everything else has a sensible default. Platform
//! OAuth credentials and webhook secrets are read per platform by the
//! platform directory, not here.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Complete service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// Path to the registry SQLite database
    pub database_path: String,
    /// Base64-encoded 32-byte master key for the token vault. Never logged.
    pub encryption_key: String,
    /// Public base URL used to build OAuth callback URLs
    pub callback_base_url: String,
    /// Shared secret the external sweep trigger must present
    pub sweep_secret: String,
    /// Whether user-facing endpoints require bearer tokens
    pub auth_enabled: bool,
    /// Authorization-state TTL
    pub state_ttl_seconds: i64,
    /// How far ahead of expiry the sweep refreshes credentials
    pub refresh_lookahead_minutes: i64,
    /// Bounded timeout for every provider HTTP call
    pub provider_timeout_seconds: u64,
    /// How often expired authorization states are physically reaped
    pub state_purge_interval_seconds: u64,
    /// Optional TOML file adding or overriding platform definitions
    pub platforms_file: Option<PathBuf>,
}

impl Config {
    /// Build from env vars, falling back to defaults for everything that
    /// has one.
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var("TETHER_ENCRYPTION_KEY")
            .context("TETHER_ENCRYPTION_KEY must be set (base64-encoded 32-byte key)")?;
        let sweep_secret = std::env::var("TETHER_SWEEP_SECRET")
            .context("TETHER_SWEEP_SECRET must be set")?;

        let mut cfg = Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            database_path: "tether.db".to_string(),
            encryption_key,
            callback_base_url: "http://localhost:3000".to_string(),
            sweep_secret,
            auth_enabled: true,
            state_ttl_seconds: 600,
            refresh_lookahead_minutes: 10,
            provider_timeout_seconds: 10,
            state_purge_interval_seconds: 300,
            platforms_file: None,
        };

        if let Ok(v) = std::env::var("TETHER_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("TETHER_DATABASE_PATH") {
            cfg.database_path = v;
        }
        if let Ok(v) = std::env::var("TETHER_CALLBACK_BASE_URL") {
            cfg.callback_base_url = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = std::env::var("TETHER_AUTH_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.auth_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("TETHER_STATE_TTL_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                cfg.state_ttl_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_REFRESH_LOOKAHEAD_MINUTES") {
            if let Ok(n) = v.parse::<i64>() {
                cfg.refresh_lookahead_minutes = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_PROVIDER_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.provider_timeout_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_STATE_PURGE_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.state_purge_interval_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_PLATFORMS_FILE") {
            cfg.platforms_file = Some(PathBuf::from(v));
        }

        Ok(cfg)
    }
}
