//! Process configuration, read once at startup from the environment (§6, §10).
//!
//! Deliberately not a JSON/YAML file plus overrides, unlike the richer
//! ambient stack this module is descended from: this service's configuration
//! surface is small and purely operational, so a single env-var pass is
//! enough. `.env` is still honored for local development convenience.

use crate::error::{CoreError, Result};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub cache_url: Option<String>,
    pub encryption_key: [u8; 32],
    pub update_mode: UpdateMode,
    pub webhook_listen_addr: Option<String>,
    pub webhook_public_url: Option<String>,
    /// Expected value of the `X-Telegram-Bot-Api-Secret-Token` header on
    /// every webhook POST; compared in constant time (§10). Required iff
    /// `update_mode=webhook`.
    pub webhook_secret: Option<String>,
    pub heartbeat_interval: Duration,
    pub supervisor_sync_interval: Duration,
    pub shutdown_grace: Duration,
    pub log_level: LogLevel,
    pub log_retention_days: u32,
    /// Whether the Enforcement Service posts a confirmation message after a
    /// restricted user clears the challenge (§4.5); purely cosmetic, off by
    /// default to avoid adding chat noise.
    pub send_verified_toast: bool,
    /// Rough count of bots this process expects to run, used only to size
    /// the Postgres pool (§4.1/§5) before the first `load_active_bots` call.
    pub expected_bots: usize,
}

impl Config {
    /// Load configuration from the process environment. Loads a `.env` file
    /// first if one is present (development convenience only).
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> Result<Self> {
        let database_url = required_var("database_url")?;
        let cache_url = optional_var("cache_url");
        let encryption_key = parse_encryption_key(&required_var("encryption_key")?)?;

        let update_mode = match optional_var("update_mode").as_deref() {
            None | Some("polling") => UpdateMode::Polling,
            Some("webhook") => UpdateMode::Webhook,
            Some(other) => {
                return Err(CoreError::Fatal(format!(
                    "update_mode must be 'polling' or 'webhook', got '{other}'"
                )))
            }
        };

        let webhook_listen_addr = optional_var("webhook_listen_addr");
        let webhook_public_url = optional_var("webhook_public_url");
        let webhook_secret = optional_var("webhook_secret");
        if update_mode == UpdateMode::Webhook
            && (webhook_listen_addr.is_none() || webhook_public_url.is_none() || webhook_secret.is_none())
        {
            return Err(CoreError::Fatal(
                "webhook_listen_addr, webhook_public_url, and webhook_secret are required when \
                 update_mode=webhook"
                    .into(),
            ));
        }

        let heartbeat_interval = Duration::from_secs(parse_u64_var("heartbeat_interval_seconds", 15)?);
        let supervisor_sync_interval =
            Duration::from_secs(parse_u64_var("supervisor_sync_interval_seconds", 30)?);
        let shutdown_grace = Duration::from_secs(parse_u64_var("shutdown_grace_seconds", 10)?);
        let log_retention_days = parse_u64_var("log_retention_days", 90)? as u32;

        let log_level = match optional_var("log_level").as_deref() {
            None | Some("info") => LogLevel::Info,
            Some("debug") => LogLevel::Debug,
            Some("warn") => LogLevel::Warn,
            Some("error") => LogLevel::Error,
            Some(other) => {
                return Err(CoreError::Fatal(format!(
                    "log_level must be one of debug|info|warn|error, got '{other}'"
                )))
            }
        };

        let send_verified_toast = parse_bool_var("send_verified_toast", false)?;
        let expected_bots = parse_u64_var("expected_bots", 20)? as usize;

        Ok(Config {
            database_url,
            cache_url,
            encryption_key,
            update_mode,
            webhook_listen_addr,
            webhook_public_url,
            webhook_secret,
            heartbeat_interval,
            supervisor_sync_interval,
            shutdown_grace,
            log_level,
            log_retention_days,
            send_verified_toast,
            expected_bots,
        })
    }
}

/// Reads `NEZUKO_<NAME_UPPERCASE>`, falling back to bare `<NAME_UPPERCASE>`
/// for operators who prefer unprefixed env vars in their deployment.
fn read_var(name: &str) -> Option<String> {
    let prefixed = format!("NEZUKO_{}", name.to_uppercase());
    std::env::var(&prefixed)
        .ok()
        .or_else(|| std::env::var(name.to_uppercase()).ok())
}

fn required_var(name: &str) -> Result<String> {
    read_var(name).ok_or_else(|| CoreError::Fatal(format!("missing required config: {name}")))
}

fn optional_var(name: &str) -> Option<String> {
    read_var(name)
}

fn parse_u64_var(name: &str, default: u64) -> Result<u64> {
    match read_var(name) {
        None => Ok(default),
        Some(val) => val
            .parse()
            .map_err(|_| CoreError::Fatal(format!("{name} must be a non-negative integer"))),
    }
}

fn parse_bool_var(name: &str, default: bool) -> Result<bool> {
    match read_var(name) {
        None => Ok(default),
        Some(val) => match val.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(CoreError::Fatal(format!("{name} must be true/false, got '{other}'"))),
        },
    }
}

fn parse_encryption_key(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| CoreError::Fatal(format!("encryption_key must be hex-encoded: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        CoreError::Fatal(format!(
            "encryption_key must decode to 32 bytes, got {}",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for name in [
            "database_url",
            "cache_url",
            "encryption_key",
            "update_mode",
            "webhook_listen_addr",
            "webhook_public_url",
            "webhook_secret",
            "heartbeat_interval_seconds",
            "supervisor_sync_interval_seconds",
            "shutdown_grace_seconds",
            "log_level",
            "log_retention_days",
        ] {
            std::env::remove_var(format!("NEZUKO_{}", name.to_uppercase()));
        }
    }

    #[test]
    fn missing_required_var_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let result = Config::from_env();
        assert!(matches!(result, Err(CoreError::Fatal(_))));
    }

    #[test]
    fn minimal_valid_config_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("NEZUKO_DATABASE_URL", "postgres://localhost/nezuko");
        std::env::set_var("NEZUKO_ENCRYPTION_KEY", "00".repeat(32));

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://localhost/nezuko");
        assert!(config.cache_url.is_none());
        assert_eq!(config.update_mode, UpdateMode::Polling);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.supervisor_sync_interval, Duration::from_secs(30));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.log_retention_days, 90);
        clear_all();
    }

    #[test]
    fn webhook_mode_requires_addr_and_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("NEZUKO_DATABASE_URL", "postgres://localhost/nezuko");
        std::env::set_var("NEZUKO_ENCRYPTION_KEY", "00".repeat(32));
        std::env::set_var("NEZUKO_UPDATE_MODE", "webhook");

        let result = Config::from_env();
        assert!(matches!(result, Err(CoreError::Fatal(_))));

        std::env::set_var("NEZUKO_WEBHOOK_LISTEN_ADDR", "0.0.0.0:8443");
        std::env::set_var("NEZUKO_WEBHOOK_PUBLIC_URL", "https://example.com/hook");
        std::env::set_var("NEZUKO_WEBHOOK_SECRET", "top-secret-token");
        let config = Config::from_env().unwrap();
        assert_eq!(config.update_mode, UpdateMode::Webhook);
        clear_all();
    }

    #[test]
    fn rejects_non_hex_encryption_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("NEZUKO_DATABASE_URL", "postgres://localhost/nezuko");
        std::env::set_var("NEZUKO_ENCRYPTION_KEY", "not-hex");
        let result = Config::from_env();
        assert!(matches!(result, Err(CoreError::Fatal(_))));
        clear_all();
    }

    #[test]
    fn rejects_wrong_length_encryption_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("NEZUKO_DATABASE_URL", "postgres://localhost/nezuko");
        std::env::set_var("NEZUKO_ENCRYPTION_KEY", "00".repeat(16));
        let result = Config::from_env();
        assert!(matches!(result, Err(CoreError::Fatal(_))));
        clear_all();
    }

    #[test]
    fn invalid_log_level_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("NEZUKO_DATABASE_URL", "postgres://localhost/nezuko");
        std::env::set_var("NEZUKO_ENCRYPTION_KEY", "00".repeat(32));
        std::env::set_var("NEZUKO_LOG_LEVEL", "verbose");
        let result = Config::from_env();
        assert!(matches!(result, Err(CoreError::Fatal(_))));
        clear_all();
    }
}
