use crate::util::decode_hex32;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "cannot read configuration"),
            Self::Parse => write!(f, "configuration line is not a key/value pair"),
            Self::Missing => write!(f, "required configuration key absent"),
            Self::Invalid => write!(f, "configuration value rejected"),
        }
    }
}

impl Error for ConfigError {}

/// Backing stores for the mailbox and presence. The memory driver keeps
/// everything in-process and loses it on restart; it exists for development
/// and tests, not deployment.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    Postgres,
    Memory,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub storage_driver: StorageDriver,
    pub postgres_dsn: Option<String>,
    pub redis_url: Option<String>,
    pub auth_secret: [u8; 32],
    pub presence_ttl_seconds: i64,
    pub heartbeat_interval_seconds: u64,
    pub retention_days: i64,
    pub purge_interval_seconds: u64,
    pub flush_limit: i64,
    pub channel_capacity: usize,
}

/// Loads the relay configuration from a sectioned key/value file, with every
/// key overridable through `SOTTO_*` environment variables.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut map = parse_file(&contents)?;

    let bind = required(override_env("SOTTO_BIND", map.remove("server.bind"))?)?;

    let driver_raw = override_env("SOTTO_STORAGE_DRIVER", map.remove("storage.driver"))?
        .unwrap_or_else(|| "postgres".to_string());
    let storage_driver = match driver_raw.as_str() {
        "postgres" => StorageDriver::Postgres,
        "memory" => StorageDriver::Memory,
        _ => return Err(ConfigError::Invalid),
    };
    let postgres_dsn = override_env("SOTTO_PG_DSN", map.remove("storage.postgres_dsn"))?;
    let redis_url = override_env("SOTTO_REDIS_URL", map.remove("storage.redis_url"))?;
    if storage_driver == StorageDriver::Postgres && (postgres_dsn.is_none() || redis_url.is_none())
    {
        return Err(ConfigError::Missing);
    }

    let secret_hex = required(override_env("SOTTO_AUTH_SECRET", map.remove("auth.secret"))?)?;
    let auth_secret = decode_hex32(&secret_hex).map_err(|_| ConfigError::Invalid)?;

    let presence_ttl: i64 = numeric("SOTTO_PRESENCE_TTL", map.remove("limits.presence_ttl"), 60)?;
    let heartbeat_interval: u64 = numeric(
        "SOTTO_HEARTBEAT_INTERVAL",
        map.remove("limits.heartbeat_interval"),
        30,
    )?;
    let retention_days: i64 = numeric(
        "SOTTO_RETENTION_DAYS",
        map.remove("limits.retention_days"),
        30,
    )?;
    let purge_interval: u64 = numeric(
        "SOTTO_PURGE_INTERVAL",
        map.remove("limits.purge_interval"),
        3600,
    )?;
    let flush_limit: i64 = numeric("SOTTO_FLUSH_LIMIT", map.remove("limits.flush_limit"), 128)?;
    let channel_capacity: usize = numeric(
        "SOTTO_CHANNEL_CAPACITY",
        map.remove("limits.channel_capacity"),
        128,
    )?;
    // Interval timers reject a zero period.
    if heartbeat_interval == 0 || purge_interval == 0 {
        return Err(ConfigError::Invalid);
    }
    // Delivery stops outright when any of these hits zero.
    if presence_ttl <= 0 || flush_limit <= 0 || channel_capacity == 0 {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        bind,
        storage_driver,
        postgres_dsn,
        redis_url,
        auth_secret,
        presence_ttl_seconds: presence_ttl,
        heartbeat_interval_seconds: heartbeat_interval,
        retention_days,
        purge_interval_seconds: purge_interval,
        flush_limit,
        channel_capacity,
    })
}

fn parse_file(contents: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(name) = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            section = name.to_string();
            continue;
        }
        let (key, rest) = trimmed.split_once('=').ok_or(ConfigError::Parse)?;
        let mut value = rest.split('#').next().unwrap_or_default().trim();
        value = value
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(value);
        let qualified = if section.is_empty() {
            key.trim().to_string()
        } else {
            format!("{}.{}", section, key.trim())
        };
        map.insert(qualified, value.to_string());
    }
    Ok(map)
}

fn override_env(key: &str, file_value: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(file_value),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn numeric<T: FromStr>(
    key: &str,
    file_value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match override_env(key, file_value)? {
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid),
        None => Ok(default),
    }
}
