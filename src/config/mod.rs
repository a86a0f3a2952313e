use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub platform_url: String,
    pub service_role_key: String,
    pub anon_key: Option<String>,
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub realtime_channel: String,
    pub server_host: String,
    pub server_port: u16,
    pub location_interval_secs: u64,
    pub avatar_bucket: String,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        Ok(Config {
            platform_url: required("PLATFORM_URL")?,
            service_role_key: required("PLATFORM_SERVICE_ROLE_KEY")?,
            anon_key: optional("PLATFORM_ANON_KEY"),
            database_url: required("DATABASE_URL")?,
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: optional("REDIS_URL"),
            realtime_channel: optional("REALTIME_CHANNEL")
                .unwrap_or_else(|| "geochat:changes".into()),
            server_host: optional("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            server_port: parsed("PORT", 3001)?,
            location_interval_secs: parsed("LOCATION_INTERVAL_SECS", 60)?,
            avatar_bucket: optional("AVATAR_BUCKET").unwrap_or_else(|| "avatars".into()),
        })
    }

    pub fn location_interval(&self) -> Duration {
        Duration::from_secs(self.location_interval_secs)
    }
}
