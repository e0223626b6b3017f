// Relay server configuration.
//
// Core server settings parsed from the environment with development
// defaults. The DB pool reads its own sizing variables (see `db::pool`).

use std::net::SocketAddr;

use crate::hub::DEFAULT_OUTBOUND_CAPACITY;

const DEV_JWT_SECRET: &str = "reviewbox_local_development_jwt_secret_32_chars";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with whoever issues user tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. Presence stays in memory without one.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
    /// Accept the `user_id` claim of the `auth` frame without a token.
    pub ws_trust_client_identity: bool,
    /// Bearer token for `/internal/v1/events`. The route is not mounted
    /// without one.
    pub internal_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `REVIEWBOX_RELAY_HOST` | `0.0.0.0` |
    /// | `REVIEWBOX_RELAY_PORT` | `8080` |
    /// | `REVIEWBOX_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `REVIEWBOX_RELAY_DATABASE_URL` | *(none, in-memory presence)* |
    /// | `REVIEWBOX_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `REVIEWBOX_RELAY_LOG_FILTER` | `info` |
    /// | `REVIEWBOX_RELAY_LOG_FORMAT` | `text` |
    /// | `REVIEWBOX_RELAY_OUTBOUND_QUEUE` | `64` |
    /// | `REVIEWBOX_RELAY_WS_TRUST_CLIENT_IDENTITY` | `false` |
    /// | `REVIEWBOX_RELAY_INTERNAL_TOKEN` | *(none, ingress disabled)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("REVIEWBOX_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("REVIEWBOX_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("REVIEWBOX_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = non_empty(env("REVIEWBOX_RELAY_DATABASE_URL").ok());
        let cors_origins = non_empty(env("REVIEWBOX_RELAY_CORS_ORIGINS").ok());
        let log_filter = env("REVIEWBOX_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("REVIEWBOX_RELAY_LOG_FORMAT").ok().as_deref().map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let outbound_queue = env("REVIEWBOX_RELAY_OUTBOUND_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OUTBOUND_CAPACITY);

        let ws_trust_client_identity = env("REVIEWBOX_RELAY_WS_TRUST_CLIENT_IDENTITY")
            .ok()
            .is_some_and(|value| parse_flag(&value));

        let internal_token = non_empty(env("REVIEWBOX_RELAY_INTERNAL_TOKEN").ok());

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            outbound_queue,
            ws_trust_client_identity,
            internal_token,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.outbound_queue, DEFAULT_OUTBOUND_CAPACITY);
        assert!(!cfg.ws_trust_client_identity);
        assert!(cfg.internal_token.is_none());
    }

    #[test]
    fn custom_host_and_port() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([
            ("REVIEWBOX_RELAY_HOST", "127.0.0.1"),
            ("REVIEWBOX_RELAY_PORT", "3000"),
        ])));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "REVIEWBOX_RELAY_PORT",
            "not_a_number",
        )])));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "REVIEWBOX_RELAY_JWT_SECRET",
            "production_secret_at_least_32_chars!!",
        )])));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn empty_database_url_means_in_memory() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "REVIEWBOX_RELAY_DATABASE_URL",
            "  ",
        )])));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn json_log_format_is_case_insensitive() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "REVIEWBOX_RELAY_LOG_FORMAT",
            "JSON",
        )])));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn zero_outbound_queue_falls_back_to_default() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "REVIEWBOX_RELAY_OUTBOUND_QUEUE",
            "0",
        )])));
        assert_eq!(cfg.outbound_queue, DEFAULT_OUTBOUND_CAPACITY);

        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "REVIEWBOX_RELAY_OUTBOUND_QUEUE",
            "256",
        )])));
        assert_eq!(cfg.outbound_queue, 256);
    }

    #[test]
    fn trust_flag_and_internal_token() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([
            ("REVIEWBOX_RELAY_WS_TRUST_CLIENT_IDENTITY", "true"),
            ("REVIEWBOX_RELAY_INTERNAL_TOKEN", "s3cret"),
        ])));
        assert!(cfg.ws_trust_client_identity);
        assert_eq!(cfg.internal_token.as_deref(), Some("s3cret"));

        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::from([(
            "REVIEWBOX_RELAY_WS_TRUST_CLIENT_IDENTITY",
            "nope",
        )])));
        assert!(!cfg.ws_trust_client_identity);
    }
}
