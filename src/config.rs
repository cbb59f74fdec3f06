use chrono::Duration;
use std::env;
use std::str::FromStr;
use thiserror::Error;

pub const DEV_JWT_SECRET: &str = "your-secret-key";

/// Longest admin session a token may grant (one year).
pub const MAX_ADMIN_TOKEN_TTL_HOURS: i64 = 24 * 365;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Runtime settings, read from the environment (and `.env` when present).
///
/// | Variable                  | Default           |
/// |---------------------------|-------------------|
/// | `BIND_ADDR`               | `127.0.0.1:3000`  |
/// | `DATABASE_PATH`           | `db/api_keys.db`  |
/// | `JWT_SECRET`              | development value |
/// | `API_KEY_PREFIX`          | `lcp`             |
/// | `API_KEY_ENVIRONMENT`     | `dev`             |
/// | `RATE_LIMIT_CLEANUP_SECS` | `60`              |
/// | `ADMIN_TOKEN_TTL_HOURS`   | `12`              |
/// | `ISSUE_ADMIN_TOKEN`       | `false`           |
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub api_key_prefix: String,
    pub api_key_environment: String,
    pub cleanup_interval_secs: u64,
    pub admin_token_ttl_hours: i64,
    pub issue_admin_token: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            database_path: "db/api_keys.db".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            api_key_prefix: "lcp".to_string(),
            api_key_environment: "dev".to_string(),
            cleanup_interval_secs: 60,
            admin_token_ttl_hours: 12,
            issue_admin_token: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from any name -> value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |name: &str, default: String| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default)
        };

        let config = Self {
            bind_addr: string("BIND_ADDR", defaults.bind_addr),
            database_path: string("DATABASE_PATH", defaults.database_path),
            jwt_secret: string("JWT_SECRET", defaults.jwt_secret),
            api_key_prefix: key_segment(&lookup, "API_KEY_PREFIX", defaults.api_key_prefix)?,
            api_key_environment: key_segment(
                &lookup,
                "API_KEY_ENVIRONMENT",
                defaults.api_key_environment,
            )?,
            cleanup_interval_secs: parsed(
                &lookup,
                "RATE_LIMIT_CLEANUP_SECS",
                defaults.cleanup_interval_secs,
            )?,
            admin_token_ttl_hours: parsed(
                &lookup,
                "ADMIN_TOKEN_TTL_HOURS",
                defaults.admin_token_ttl_hours,
            )?,
            issue_admin_token: parsed(&lookup, "ISSUE_ADMIN_TOKEN", defaults.issue_admin_token)?,
        };

        config.admin_token_ttl()?;
        Ok(config)
    }

    pub fn admin_token_ttl(&self) -> Result<Duration, ConfigError> {
        let hours = self.admin_token_ttl_hours;
        if !(1..=MAX_ADMIN_TOKEN_TTL_HOURS).contains(&hours) {
            return Err(ConfigError::Invalid {
                name: "ADMIN_TOKEN_TTL_HOURS",
                value: hours.to_string(),
            });
        }
        Duration::try_hours(hours).ok_or(ConfigError::Invalid {
            name: "ADMIN_TOKEN_TTL_HOURS",
            value: hours.to_string(),
        })
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

// Key material is split on '_', so prefix and environment must not contain it.
fn key_segment<F>(lookup: &F, name: &'static str, default: String) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    let segment = value.trim();
    if segment.is_empty() || segment.contains('_') {
        return Err(ConfigError::Invalid { name, value });
    }
    Ok(segment.to_string())
}

fn parsed<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(default),
    }
}
