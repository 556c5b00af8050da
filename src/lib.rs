// Token vault (encryption at rest)
pub mod vault;

// Connection registry and its SQLite stores
pub mod registry;

// Platform directory (OAuth endpoints, scopes, webhook policy)
pub mod platforms;

// HTTP APIs
pub mod api;

// Bearer-token extraction
pub mod auth;

// Refresh sweep
pub mod refresh;

// Provider webhook verification and parsing
pub mod webhooks;

// Service configuration
pub mod config;
