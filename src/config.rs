//! Runtime configuration for the chat server.

use crate::waiter::PollPolicy;
use crate::{Result, SolaceError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Number of warm conversation handles kept in the pool.
pub const DEFAULT_POOL_TARGET: usize = 3;

/// Period between pool maintenance passes.
pub const DEFAULT_MAINTENANCE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Upper bound on how long startup waits for the initial pool fill.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime config for the server and its background services.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub pool_target: usize,
    pub maintenance_period: Duration,
    pub init_timeout: Duration,
    pub poll: PollPolicy,
    /// Simulated think time of the built-in assistant.
    pub assistant_latency: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            db_path: default_db_path(),
            pool_target: DEFAULT_POOL_TARGET,
            maintenance_period: DEFAULT_MAINTENANCE_PERIOD,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            poll: PollPolicy::default(),
            assistant_latency: Duration::from_millis(800),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `SOLACE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_var("SOLACE_BIND")? {
            config.bind_addr = addr
                .parse()
                .map_err(|e| SolaceError::Config(format!("SOLACE_BIND '{}': {}", addr, e)))?;
        }
        if let Some(path) = env_var("SOLACE_DB")? {
            config.db_path = PathBuf::from(path);
        }
        if let Some(size) = env_parse::<usize>("SOLACE_POOL_SIZE")? {
            config.pool_target = size;
        }
        if let Some(secs) = env_parse::<u64>("SOLACE_MAINTENANCE_SECS")? {
            config.maintenance_period = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SOLACE_RUN_TIMEOUT_SECS")? {
            config.poll.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("SOLACE_ASSISTANT_LATENCY_MS")? {
            config.assistant_latency = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maintenance_period.is_zero() {
            return Err(SolaceError::Config(
                "maintenance period must be non-zero".to_string(),
            ));
        }
        self.poll.validate()
    }
}

/// `~/.solace/solace.db`, or `./solace.db` when no home directory is known.
pub fn default_db_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".solace").join("solace.db"),
        None => PathBuf::from("solace.db"),
    }
}

fn env_var(key: &str) -> Result<Option<String>> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(SolaceError::Config(format!("{}: {}", key, e))),
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key)? {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SolaceError::Config(format!("{} '{}': {}", key, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert_eq!(config.pool_target, 3);
        assert_eq!(config.maintenance_period, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_maintenance_period_is_rejected() {
        let config = AppConfig {
            maintenance_period: Duration::ZERO,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(SolaceError::Config(_))));
    }

    #[test]
    fn default_db_path_ends_in_solace_db() {
        assert!(default_db_path().ends_with("solace.db"));
    }
}
