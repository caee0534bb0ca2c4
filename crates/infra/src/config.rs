//! Process-wide queue configuration, read once at startup.

use std::str::FromStr;
use std::time::Duration;

use crate::dispatch::{DEFAULT_EVENTS_KEY, DEFAULT_EVENTS_MAX_LEN, DEFAULT_PENDING_KEY};

/// Default processing lease before a row is reaped.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(900);

/// Default sweeper period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Which dispatch mechanism the process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Workers claim rows from Postgres directly.
    Postgres,
    /// Ready ids are handed off through a Redis list.
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Redis => "redis",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend '{other}', expected postgres or redis")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub backend: BackendKind,
    pub redis_url: Option<String>,
    pub pending_key: String,
    pub events_key: String,
    pub events_max_len: usize,
    pub lease_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Postgres,
            redis_url: None,
            pending_key: DEFAULT_PENDING_KEY.to_string(),
            events_key: DEFAULT_EVENTS_KEY.to_string(),
            events_max_len: DEFAULT_EVENTS_MAX_LEN,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let backend = match get("JOB_QUEUE_BACKEND") {
            Some(raw) => raw.parse::<BackendKind>().map_err(|reason| ConfigError::Invalid {
                name: "JOB_QUEUE_BACKEND",
                value: raw.clone(),
                reason,
            })?,
            None => defaults.backend,
        };

        let redis_url = get("REDIS_URL");
        if backend == BackendKind::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        let events_max_len = match get("JOB_QUEUE_EVENTS_MAX_LEN") {
            Some(raw) => parse_positive("JOB_QUEUE_EVENTS_MAX_LEN", &raw)? as usize,
            None => defaults.events_max_len,
        };

        let lease_timeout = match get("JOB_LEASE_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("JOB_LEASE_TIMEOUT_SECS", &raw)?),
            None => defaults.lease_timeout,
        };

        let sweep_interval = match get("JOB_SWEEP_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("JOB_SWEEP_INTERVAL_SECS", &raw)?),
            None => defaults.sweep_interval,
        };

        Ok(Self {
            backend,
            redis_url,
            pending_key: get("JOB_QUEUE_PENDING_KEY").unwrap_or(defaults.pending_key),
            events_key: get("JOB_QUEUE_EVENTS_KEY").unwrap_or(defaults.events_key),
            events_max_len,
            lease_timeout,
            sweep_interval,
        })
    }

    pub fn is_accelerated(&self) -> bool {
        self.backend == BackendKind::Redis
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason,
    };
    let value = raw.trim().parse::<u64>().map_err(|e| invalid(e.to_string()))?;
    if value == 0 {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(value)
}
