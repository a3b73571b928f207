use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Operator-tunable booking rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPolicy {
    /// New reservations start `confirmed` when set, `pending` otherwise.
    pub auto_confirm: bool,
    /// Same-day active reservations allowed per user.
    pub daily_limit: usize,
    pub max_party_size: u32,
    pub default_buffer_minutes: u16,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            auto_confirm: true,
            daily_limit: DEFAULT_DAILY_LIMIT,
            max_party_size: DEFAULT_MAX_PARTY_SIZE,
            default_buffer_minutes: DEFAULT_BUFFER_MINUTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub auto_complete: bool,
    pub sweep_interval: Duration,
    pub policy: BookingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            password: "tablebook".into(),
            max_connections: 256,
            metrics_port: None,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            auto_complete: true,
            sweep_interval: Duration::from_secs(60),
            policy: BookingPolicy::default(),
        }
    }
}

impl Config {
    /// Read `TABLEBOOK_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let buffer: u16 = parse_or(get("TABLEBOOK_DEFAULT_BUFFER"), "TABLEBOOK_DEFAULT_BUFFER", d.policy.default_buffer_minutes)?;
        if buffer > MAX_BUFFER_MINUTES {
            return Err(ConfigError::Invalid {
                var: "TABLEBOOK_DEFAULT_BUFFER",
                value: buffer.to_string(),
            });
        }

        Ok(Self {
            bind: get("TABLEBOOK_BIND").unwrap_or(d.bind),
            port: parse_or(get("TABLEBOOK_PORT"), "TABLEBOOK_PORT", d.port)?,
            data_dir: get("TABLEBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("TABLEBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parse_or(get("TABLEBOOK_MAX_CONNECTIONS"), "TABLEBOOK_MAX_CONNECTIONS", d.max_connections)?,
            metrics_port: get("TABLEBOOK_METRICS_PORT")
                .map(|v| parse("TABLEBOOK_METRICS_PORT", v))
                .transpose()?,
            compact_threshold: parse_or(get("TABLEBOOK_COMPACT_THRESHOLD"), "TABLEBOOK_COMPACT_THRESHOLD", d.compact_threshold)?,
            lock_timeout: Duration::from_millis(parse_or(
                get("TABLEBOOK_LOCK_TIMEOUT_MS"),
                "TABLEBOOK_LOCK_TIMEOUT_MS",
                DEFAULT_LOCK_TIMEOUT_MS,
            )?),
            auto_complete: parse_or(get("TABLEBOOK_AUTO_COMPLETE"), "TABLEBOOK_AUTO_COMPLETE", d.auto_complete)?,
            sweep_interval: Duration::from_secs(parse_or(
                get("TABLEBOOK_SWEEP_INTERVAL_SECS"),
                "TABLEBOOK_SWEEP_INTERVAL_SECS",
                d.sweep_interval.as_secs(),
            )?),
            policy: BookingPolicy {
                auto_confirm: parse_or(get("TABLEBOOK_AUTO_CONFIRM"), "TABLEBOOK_AUTO_CONFIRM", d.policy.auto_confirm)?,
                daily_limit: parse_or(get("TABLEBOOK_DAILY_LIMIT"), "TABLEBOOK_DAILY_LIMIT", d.policy.daily_limit)?,
                max_party_size: parse_or(get("TABLEBOOK_MAX_PARTY_SIZE"), "TABLEBOOK_MAX_PARTY_SIZE", d.policy.max_party_size)?,
                default_buffer_minutes: buffer,
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tablebook.wal")
    }
}

fn parse<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

fn parse_or<T: FromStr>(value: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError> {
    value.map_or(Ok(default), |v| parse(var, v))
}
