//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agora_shared::constants::{
    DEFAULT_HISTORY_LIMIT, DEFAULT_HTTP_PORT, DEFAULT_TOKEN_TTL_SECS, MAX_MESSAGE_LEN,
    MAX_PAGE_SIZE,
};

/// Development-only signing secret. A warning is logged when it is in use.
pub const DEV_JWT_SECRET: &str = "agora-dev-secret-change-me";

/// Longest accepted `TOKEN_TTL_SECS`: one year.
const MAX_TOKEN_TTL_SECS: i64 = 365 * 24 * 60 * 60;

/// Longest accepted `INACTIVE_USER_RETENTION_DAYS`: a century.
const MAX_RETENTION_DAYS: i64 = 36_500;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8001`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./agora.db`
    pub database_path: PathBuf,

    /// HS256 signing secret for access tokens.
    /// Env: `JWT_SECRET`
    /// Default: [`DEV_JWT_SECRET`] (development only).
    pub jwt_secret: String,

    /// Access token lifetime.
    /// Env: `TOKEN_TTL_SECS`
    /// Default: 15 minutes.
    pub token_ttl: chrono::Duration,

    /// Messages replayed to a newly connected member.
    /// Env: `HISTORY_LIMIT`
    /// Default: `10`
    pub history_limit: u32,

    /// Maximum message length in characters.
    /// Env: `MAX_MESSAGE_LEN`
    /// Default: `4096`
    pub max_message_len: usize,

    /// Frames buffered per connection before delivery to it is dropped.
    /// Env: `OUTBOUND_BUFFER`
    /// Default: `256`
    pub outbound_buffer: usize,

    /// Close a connection after this long without an inbound frame.
    /// Env: `IDLE_TIMEOUT_SECS` (0 or unset disables)
    /// Default: disabled.
    pub idle_timeout: Option<Duration>,

    /// Days a deactivated user is kept before being purged.
    /// Env: `INACTIVE_USER_RETENTION_DAYS`
    /// Default: `30`
    pub inactive_retention_days: i64,

    /// How often the inactive-user purge runs.
    /// Env: `PURGE_INTERVAL_SECS`
    /// Default: one day.
    pub purge_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./agora.db"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_ttl: chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_message_len: MAX_MESSAGE_LEN,
            outbound_buffer: 256,
            idle_timeout: None,
            inactive_retention_days: 30,
            purge_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

// The secret stays out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl.num_seconds())
            .field("history_limit", &self.history_limit)
            .field("max_message_len", &self.max_message_len)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("idle_timeout", &self.idle_timeout)
            .field("inactive_retention_days", &self.inactive_retention_days)
            .field("purge_interval", &self.purge_interval)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(secret) = lookup("JWT_SECRET") {
            if !secret.is_empty() {
                config.jwt_secret = secret;
            }
        }

        if let Some(secs) = parse_var::<i64>(&lookup, "TOKEN_TTL_SECS") {
            match chrono::Duration::try_seconds(secs) {
                Some(ttl) if (1..=MAX_TOKEN_TTL_SECS).contains(&secs) => config.token_ttl = ttl,
                _ => tracing::warn!(secs, "TOKEN_TTL_SECS out of range, using default"),
            }
        }

        if let Some(n) = parse_var::<u32>(&lookup, "HISTORY_LIMIT") {
            config.history_limit = n.min(MAX_PAGE_SIZE);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "MAX_MESSAGE_LEN") {
            if n > 0 {
                config.max_message_len = n;
            }
        }

        if let Some(n) = parse_var::<usize>(&lookup, "OUTBOUND_BUFFER") {
            // tokio's bounded channel panics on zero capacity.
            config.outbound_buffer = n.max(1);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "IDLE_TIMEOUT_SECS") {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(days) = parse_var::<i64>(&lookup, "INACTIVE_USER_RETENTION_DAYS") {
            if (0..=MAX_RETENTION_DAYS).contains(&days) {
                config.inactive_retention_days = days;
            } else {
                tracing::warn!(days, "INACTIVE_USER_RETENTION_DAYS out of range, using default");
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "PURGE_INTERVAL_SECS") {
            if secs > 0 {
                config.purge_interval = Duration::from_secs(secs);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
