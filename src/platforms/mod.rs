//! Platform directory: per-platform OAuth and webhook configuration.
//!
//! Platform differences (endpoints, scopes, extra authorization parameters,
//! where the provider's user id lives in the token response) are data, not
//! code paths: a built-in table covers the stock platforms and an optional
//! TOML file can add or override entries, so a new platform is configuration.
//! Client credentials and webhook secrets always come from per-platform
//! environment variables and never from the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// OAuth client credentials for one platform, from
/// `TETHER_OAUTH_<PLATFORM>_CLIENT_ID` / `_CLIENT_SECRET`.
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// One platform entry in the directory.
#[derive(Clone, Debug)]
pub struct Platform {
    pub id: String,
    /// OAuth authorization endpoint
    pub auth_url: String,
    /// OAuth token endpoint (code exchange and refresh grants)
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Additional authorization-URL query parameters some providers require
    /// (e.g. `access_type=offline`). Pure configuration, not control flow.
    pub extra_auth_params: BTreeMap<String, String>,
    /// JSON pointer into the token response where the provider-side user id
    /// lives (e.g. `/athlete/id`), when the provider returns one.
    pub identity_pointer: Option<String>,
    /// `None` means the platform is known but not configured for this
    /// deployment (missing env vars).
    pub credentials: Option<ClientCredentials>,
    /// Shared secret for webhook signature verification, from
    /// `TETHER_WEBHOOK_<PLATFORM>_SECRET`.
    pub webhook_secret: Option<String>,
}

impl Platform {
    /// Builds the provider authorization URL embedding the state token.
    pub fn build_auth_url(&self, client_id: &str, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        for (key, value) in &self.extra_auth_params {
            url.push('&');
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }
}

/// Directory of all known platforms, immutable after startup.
pub struct PlatformDirectory {
    platforms: HashMap<String, Platform>,
}

impl PlatformDirectory {
    /// Builds the directory from the built-in table, an optional TOML
    /// override file, and per-platform environment variables.
    pub fn from_env(overrides_file: Option<&Path>) -> Result<Self> {
        let mut defs = builtin_platforms();

        if let Some(path) = overrides_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read platform file {}", path.display()))?;
            let file: PlatformFile =
                toml::from_str(&raw).context("Failed to parse platform file")?;
            for (id, def) in file.platforms {
                defs.insert(id, def);
            }
        }

        let platforms = defs
            .into_iter()
            .map(|(id, def)| {
                let env_id = id.to_uppercase();
                let credentials = match (
                    std::env::var(format!("TETHER_OAUTH_{env_id}_CLIENT_ID")),
                    std::env::var(format!("TETHER_OAUTH_{env_id}_CLIENT_SECRET")),
                ) {
                    (Ok(client_id), Ok(client_secret)) => Some(ClientCredentials {
                        client_id,
                        client_secret,
                    }),
                    _ => None,
                };
                let webhook_secret =
                    std::env::var(format!("TETHER_WEBHOOK_{env_id}_SECRET")).ok();

                let platform = Platform {
                    id: id.clone(),
                    auth_url: def.auth_url,
                    token_url: def.token_url,
                    scopes: def.scopes,
                    extra_auth_params: def.extra_auth_params,
                    identity_pointer: def.identity_pointer,
                    credentials,
                    webhook_secret,
                };
                (id, platform)
            })
            .collect();

        Ok(Self { platforms })
    }

    /// Builds a directory from explicit entries. Used by tests and by
    /// deployments that wire configuration programmatically.
    pub fn from_entries(entries: Vec<Platform>) -> Self {
        Self {
            platforms: entries.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, platform: &str) -> Option<&Platform> {
        self.platforms.get(platform)
    }

    pub fn is_known(&self, platform: &str) -> bool {
        self.platforms.contains_key(platform)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.platforms.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Platform definition as it appears in the override file.
#[derive(Debug, Deserialize)]
struct PlatformDef {
    auth_url: String,
    token_url: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    extra_auth_params: BTreeMap<String, String>,
    #[serde(default)]
    identity_pointer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformFile {
    #[serde(default)]
    platforms: HashMap<String, PlatformDef>,
}

fn builtin_platforms() -> HashMap<String, PlatformDef> {
    let mut defs = HashMap::new();

    defs.insert(
        "spotify".to_string(),
        PlatformDef {
            auth_url: "https://accounts.spotify.com/authorize".to_string(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
            scopes: vec![
                "user-read-recently-played".to_string(),
                "user-top-read".to_string(),
            ],
            extra_auth_params: BTreeMap::new(),
            identity_pointer: None,
        },
    );

    defs.insert(
        "strava".to_string(),
        PlatformDef {
            auth_url: "https://www.strava.com/oauth/authorize".to_string(),
            token_url: "https://www.strava.com/oauth/token".to_string(),
            scopes: vec!["read".to_string(), "activity:read_all".to_string()],
            extra_auth_params: BTreeMap::from([(
                "approval_prompt".to_string(),
                "auto".to_string(),
            )]),
            identity_pointer: Some("/athlete/id".to_string()),
        },
    );

    defs.insert(
        "fitbit".to_string(),
        PlatformDef {
            auth_url: "https://www.fitbit.com/oauth2/authorize".to_string(),
            token_url: "https://api.fitbit.com/oauth2/token".to_string(),
            scopes: vec![
                "activity".to_string(),
                "heartrate".to_string(),
                "sleep".to_string(),
            ],
            extra_auth_params: BTreeMap::new(),
            identity_pointer: Some("/user_id".to_string()),
        },
    );

    defs.insert(
        "whoop".to_string(),
        PlatformDef {
            auth_url: "https://api.prod.whoop.com/oauth/oauth2/auth".to_string(),
            token_url: "https://api.prod.whoop.com/oauth/oauth2/token".to_string(),
            scopes: vec!["read:workout".to_string(), "read:sleep".to_string()],
            extra_auth_params: BTreeMap::new(),
            identity_pointer: Some("/user_id".to_string()),
        },
    );

    defs.insert(
        "github".to_string(),
        PlatformDef {
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            scopes: vec!["repo".to_string(), "read:user".to_string()],
            extra_auth_params: BTreeMap::new(),
            identity_pointer: None,
        },
    );

    defs.insert(
        "gmail".to_string(),
        PlatformDef {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
            // Google only issues a refresh token with these set
            extra_auth_params: BTreeMap::from([
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ]),
            identity_pointer: None,
        },
    );

    defs
}
