//! Typed, env-driven configuration (ambient). Loaded once at boot; a
//! malformed or missing required value fails boot with a descriptive error
//! rather than silently falling back.

use crate::error::PipelineError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub retention_days: i64,
    pub wal_file_path: String,
    pub wal_max_size_bytes: u64,
    pub replay_interval: Duration,
    pub database_url: String,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, PipelineError> {
        Ok(Self {
            retention_days: parse_or_default("RETENTION_DAYS", 180)?,
            wal_file_path: std::env::var("WAL_FILE_PATH").unwrap_or_else(|_| "tokens.wal".to_string()),
            wal_max_size_bytes: parse_or_default("WAL_MAX_SIZE_BYTES", 100 * 1024 * 1024)?,
            replay_interval: Duration::from_secs(parse_or_default("REPLAY_INTERVAL_SECONDS", 10)?),
            database_url: required_env("DATABASE_URL")?,
            shutdown_grace: Duration::from_secs(parse_or_default("SHUTDOWN_GRACE_SECONDS", 15)?),
        })
    }
}

fn required_env(key: &str) -> Result<String, PipelineError> {
    std::env::var(key).map_err(|_| PipelineError::Config(format!("missing required environment variable {key}")))
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, PipelineError>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| PipelineError::Config(format!("{key} must be a valid number, got {value:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "RETENTION_DAYS",
            "WAL_FILE_PATH",
            "WAL_MAX_SIZE_BYTES",
            "REPLAY_INTERVAL_SECONDS",
            "DATABASE_URL",
            "SHUTDOWN_GRACE_SECONDS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn fails_boot_when_database_url_is_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let result = Config::from_env();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn applies_documented_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        let config = Config::from_env().unwrap();
        assert_eq!(config.retention_days, 180);
        assert_eq!(config.wal_file_path, "tokens.wal");
        assert_eq!(config.wal_max_size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.replay_interval, Duration::from_secs(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(15));
        clear_all();
    }

    #[test]
    fn malformed_numeric_value_fails_boot() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        std::env::set_var("RETENTION_DAYS", "not-a-number");
        let result = Config::from_env();
        assert!(matches!(result, Err(PipelineError::Config(_))));
        clear_all();
    }
}
