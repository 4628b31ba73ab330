//! Configuration module for the showroom sync backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Path to the JSON document file
    pub db_path: PathBuf,
    /// Origins allowed for CORS and echoed back; empty means wildcard
    pub allowed_origins: Vec<String>,
    /// Require an auth handshake before accepting mutation messages
    pub require_auth: bool,
    /// Shared secret for envelope signing (HMAC-SHA256)
    pub auth_secret: Option<String>,
    /// Maximum number of concurrent websocket connections
    pub max_connections: usize,
    /// Maximum accepted deviation between envelope and server time
    pub max_clock_skew: Duration,
    /// Upper bound on a single store write before the operation fails
    pub store_timeout: Duration,
    /// Interval between server pings on an open connection
    pub heartbeat_interval: Duration,
    /// Connections silent longer than this are closed
    pub idle_timeout: Duration,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let bind_addr = env::var("SHOWROOM_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8081".to_string())
            .parse()
            .expect("Invalid SHOWROOM_BIND_ADDR format");

        let db_path = env::var("SHOWROOM_DB_PATH")
            .unwrap_or_else(|_| "./data/inventory.json".to_string())
            .into();

        let allowed_origins = env::var("SHOWROOM_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let require_auth = env::var("SHOWROOM_REQUIRE_AUTH")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let auth_secret = env::var("SHOWROOM_AUTH_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        let max_connections = parse_env("SHOWROOM_MAX_CONNECTIONS", 100);
        let max_clock_skew = Duration::from_millis(parse_env("SHOWROOM_MAX_CLOCK_SKEW_MS", 10_000));
        let store_timeout = Duration::from_millis(parse_env("SHOWROOM_STORE_TIMEOUT_MS", 5_000));
        let heartbeat_interval =
            Duration::from_millis(parse_env("SHOWROOM_HEARTBEAT_INTERVAL_MS", 30_000));
        let idle_timeout = Duration::from_millis(parse_env("SHOWROOM_IDLE_TIMEOUT_MS", 300_000));

        let log_level = env::var("SHOWROOM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Self {
            bind_addr,
            db_path,
            allowed_origins,
            require_auth,
            auth_secret,
            max_connections,
            max_clock_skew,
            store_timeout,
            heartbeat_interval,
            idle_timeout,
            log_level,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
