//! Runtime configuration read from the environment (and `.env`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://sectionsd.sqlite3";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_BOT_USERNAME: &str = "SmartEduProjectBot";
pub const DEFAULT_TELEGRAM_SERVICE_URL: &str = "http://localhost:8001";
pub const DEFAULT_LOG_LEVEL: &str = "sectionsd=info,tower_http=info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseLocation,
    pub bind_addr: SocketAddr,
    pub telegram_bot_token: Option<String>,
    pub telegram_bot_username: String,
    pub telegram_service_url: String,
    pub api_base_url: Option<String>,
    pub otp_secret_key: String,
    pub redis_url: Option<String>,
    pub cors_allowed_origins: Vec<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub clamav_addr: Option<String>,
    pub ai_review_url: Option<String>,
    pub ai_threshold: u8,
    pub reconcile_interval: Duration,
    pub provision_poll_interval: Duration,
    pub validation_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside development.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database = parse_database_url(
            &var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
        )?;

        let bind_raw = var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse().map_err(|e| ConfigError::Invalid {
            key: "BIND_ADDR",
            reason: format!("{bind_raw}: {e}"),
        })?;

        let otp_secret_key = var("OTP_SECRET_KEY").ok_or(ConfigError::Missing("OTP_SECRET_KEY"))?;

        let cors_allowed_origins = var("CORS_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let ai_threshold = match var("AI_DEFAULT_THRESHOLD") {
            Some(v) => match v.parse::<u8>() {
                Ok(n) if n <= 100 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "AI_DEFAULT_THRESHOLD",
                        reason: format!("{v} is not an integer in 0..=100"),
                    })
                }
            },
            None => 70,
        };

        Ok(Self {
            database,
            bind_addr,
            telegram_bot_token: var("TELEGRAM_BOT_TOKEN"),
            telegram_bot_username: var("TELEGRAM_BOT_USERNAME")
                .unwrap_or_else(|| DEFAULT_BOT_USERNAME.to_string()),
            telegram_service_url: var("TELEGRAM_SERVICE_URL")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_SERVICE_URL.to_string()),
            api_base_url: var("API_BASE_URL"),
            otp_secret_key,
            redis_url: var("REDIS_URL"),
            cors_allowed_origins,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_file: var("LOG_FILE").map(PathBuf::from),
            clamav_addr: var("CLAMAV_ADDR"),
            ai_review_url: var("AI_REVIEW_URL"),
            ai_threshold,
            reconcile_interval: secs(&var, "RECONCILE_INTERVAL_SECS", 300)?,
            provision_poll_interval: secs(&var, "PROVISION_POLL_SECS", 60)?,
            validation_timeout: secs(&var, "VALIDATION_TIMEOUT_SECS", 30)?,
        })
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match var(key) {
        None => Ok(Duration::from_secs(default)),
        Some(v) => match v.parse::<u64>() {
            Ok(n) if n > 0 => Ok(Duration::from_secs(n)),
            _ => Err(ConfigError::Invalid {
                key,
                reason: format!("{v} is not a positive number of seconds"),
            }),
        },
    }
}

/// Accepts `sqlite://<path>`, `sqlite:<path>`, a bare path, or `:memory:`.
pub fn parse_database_url(url: &str) -> Result<DatabaseLocation, ConfigError> {
    let url = url.trim();
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if rest.is_empty() {
        return Err(ConfigError::Invalid {
            key: "DATABASE_URL",
            reason: "empty database path".into(),
        });
    }
    if rest == ":memory:" {
        return Ok(DatabaseLocation::Memory);
    }
    if rest.contains("://") {
        return Err(ConfigError::Invalid {
            key: "DATABASE_URL",
            reason: format!("unsupported scheme in {url}; only sqlite is available"),
        });
    }
    Ok(DatabaseLocation::File(PathBuf::from(rest)))
}
