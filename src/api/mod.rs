// HTTP APIs: authorization flow, connection status, webhook ingress, sweep trigger

pub mod connections;
pub mod oauth;
pub mod refresh;
pub mod webhooks;

pub use connections::{create_connection_router, ConnectionAppState};
pub use oauth::{create_oauth_router, run_state_purge, OAuthAppState};
pub use refresh::{create_refresh_router, RefreshAppState};
pub use webhooks::{create_webhook_router, WebhookAppState};
