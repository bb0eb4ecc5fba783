use rust_decimal::Decimal;
use std::env;
use std::time::Duration;

use crate::monitor::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    // Bearer tokens; unset disables the check for that route group
    pub api_token: Option<String>,
    pub terminal_token: Option<String>,

    // Exit level encryption
    pub exit_key: String,
    pub exit_key_id: u8,
    pub exit_retired_keys: Vec<(u8, String)>,

    // Monitor
    pub monitor_enabled: bool,
    pub monitor_interval_ms: u64,
    pub monitor_max_concurrency: usize,
    pub monitor_eval_timeout_ms: u64,
    pub monitor_shutdown_grace_ms: u64,
    pub monitor_max_backoff_ms: u64,
    pub alert_after_failures: u32,
    pub breach_tolerance: Decimal,
    pub command_ttl_secs: u64,

    // Prices
    pub price_oracle_url: String,
    pub price_cache_ttl_ms: u64,
    pub max_quote_age_secs: u64,

    // Direct broker (optional)
    pub broker_api_url: Option<String>,
    pub broker_api_key: Option<String>,
    pub broker_api_secret: Option<String>,

    // Telegram (optional)
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,

            api_token: non_empty("API_TOKEN"),
            terminal_token: non_empty("TERMINAL_TOKEN"),

            exit_key: env::var("EXIT_KEY").map_err(|_| anyhow::anyhow!("EXIT_KEY must be set"))?,
            exit_key_id: env::var("EXIT_KEY_ID")
                .unwrap_or_else(|_| "1".into())
                .parse()?,
            exit_retired_keys: parse_retired_keys(
                &env::var("EXIT_RETIRED_KEYS").unwrap_or_default(),
            )?,

            monitor_enabled: env::var("MONITOR_ENABLED")
                .unwrap_or_else(|_| "true".into())
                .parse()
                .unwrap_or(true),
            monitor_interval_ms: parse_or("MONITOR_INTERVAL_MS", 2_000)?,
            monitor_max_concurrency: parse_or("MONITOR_MAX_CONCURRENCY", 16)?,
            monitor_eval_timeout_ms: parse_or("MONITOR_EVAL_TIMEOUT_MS", 5_000)?,
            monitor_shutdown_grace_ms: parse_or("MONITOR_SHUTDOWN_GRACE_MS", 10_000)?,
            monitor_max_backoff_ms: parse_or("MONITOR_MAX_BACKOFF_MS", 60_000)?,
            alert_after_failures: parse_or("ALERT_AFTER_FAILURES", 5)?,
            breach_tolerance: parse_or("BREACH_TOLERANCE", Decimal::ZERO)?,
            command_ttl_secs: parse_or("COMMAND_TTL_SECS", 120)?,

            price_oracle_url: env::var("PRICE_ORACLE_URL")
                .map_err(|_| anyhow::anyhow!("PRICE_ORACLE_URL must be set"))?,
            price_cache_ttl_ms: parse_or("PRICE_CACHE_TTL_MS", 1_000)?,
            max_quote_age_secs: parse_or("MAX_QUOTE_AGE_SECS", 30)?,

            broker_api_url: non_empty("BROKER_API_URL"),
            broker_api_key: non_empty("BROKER_API_KEY"),
            broker_api_secret: non_empty("BROKER_API_SECRET"),

            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: non_empty("TELEGRAM_CHAT_ID"),

            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }

    /// Returns true if all direct broker settings are configured.
    pub fn has_broker_auth(&self) -> bool {
        self.broker_api_url.is_some()
            && self.broker_api_key.is_some()
            && self.broker_api_secret.is_some()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_millis(self.monitor_interval_ms),
            max_concurrency: self.monitor_max_concurrency.max(1),
            eval_timeout: Duration::from_millis(self.monitor_eval_timeout_ms),
            shutdown_grace: Duration::from_millis(self.monitor_shutdown_grace_ms),
            max_backoff: Duration::from_millis(self.monitor_max_backoff_ms),
            alert_after_failures: self.alert_after_failures.max(1),
            tolerance: self.breach_tolerance,
        }
    }

    pub fn command_ttl(&self) -> Duration {
        Duration::from_secs(self.command_ttl_secs)
    }

    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.price_cache_ttl_ms)
    }

    pub fn max_quote_age(&self) -> Duration {
        Duration::from_secs(self.max_quote_age_secs)
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("exit_key_id", &self.exit_key_id)
            .field("monitor_enabled", &self.monitor_enabled)
            .field("monitor_interval_ms", &self.monitor_interval_ms)
            .field("price_oracle_url", &self.price_oracle_url)
            .field("broker_api_url", &self.broker_api_url)
            .finish_non_exhaustive()
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        _ => Ok(default),
    }
}

/// Parse `id:base64,id:base64` into retired key entries.
pub fn parse_retired_keys(raw: &str) -> anyhow::Result<Vec<(u8, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, key) = entry
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("retired key entry must be id:key"))?;
            let id: u8 = id
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid retired key id {id:?}: {e}"))?;
            Ok((id, key.trim().to_string()))
        })
        .collect()
}
