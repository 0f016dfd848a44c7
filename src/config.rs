//! Runtime configuration
//!
//! Values come from the environment (a `.env` file is honoured when the
//! binary calls [`load_dotenv`]); anything missing or unparsable falls back to
//! the defaults below.

use std::time::Duration;

use tracing::warn;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost:5432/rfid";
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_EXIT_POLL_MS: u64 = 3_000;
pub const DEFAULT_EXIT_WINDOW_SECS: u64 = 180;

/// Load `.env` if present. Missing files are not an error.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment value");
            None
        }
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

impl DatabaseConfig {
    /// `DATABASE_URL` and `DATABASE_POOL_SIZE` over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_parse("DATABASE_POOL_SIZE").unwrap_or(defaults.max_connections),
            ..defaults
        }
    }
}

/// Engine and background-job tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Longest wait for a row lock before an operation fails.
    pub lock_timeout: Duration,
    /// Pause between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Pause between exit-log scans.
    pub exit_poll_interval: Duration,
    /// Exit taps older than this are never acted on.
    pub exit_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            exit_poll_interval: Duration::from_millis(DEFAULT_EXIT_POLL_MS),
            exit_window: Duration::from_secs(DEFAULT_EXIT_WINDOW_SECS),
        }
    }
}

impl EngineConfig {
    /// `TAG_LOCK_TIMEOUT_MS`, `TAG_RECONCILE_INTERVAL_SECS`, `TAG_EXIT_POLL_MS`
    /// and `TAG_EXIT_WINDOW_SECS` over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout: env_parse("TAG_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            reconcile_interval: env_parse("TAG_RECONCILE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_interval),
            exit_poll_interval: env_parse("TAG_EXIT_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.exit_poll_interval),
            exit_window: env_parse("TAG_EXIT_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.exit_window),
        }
    }
}

/// Mask the password in a database URL for logging
pub fn mask_database_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let mut masked = parsed.clone();
        if parsed.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else {
        // Slice by character; the raw value may not be ASCII.
        let len = url.chars().count();
        if len <= 20 {
            return "***".to_string();
        }
        let head: String = url.chars().take(10).collect();
        let tail: String = url.chars().skip(len - 10).collect();
        format!("{head}***{tail}")
    }
}
