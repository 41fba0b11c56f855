//! Configuration module
//!
//! Quota limits, concurrency limits, the storage fail policy and database
//! connection settings. Everything is read from the environment with defaults.

use std::env;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::Tier;

const DAILY_TOTAL_LIMIT_FREE: i64 = 10;
const DAILY_TOTAL_LIMIT_PREMIUM: i64 = 10;
const DAILY_LLM_LIMIT_FREE: i64 = 1;
const DAILY_REQUEST_LIMIT_PER_USER: i64 = 100;
const DAILY_REQUEST_LIMIT_PER_IP: i64 = 50;
const MAX_CONCURRENT_GLOBAL: i64 = 10;
const MAX_CONCURRENT_PER_USER: i64 = 1;
const RETENTION_DAYS: i64 = 30;
const MAX_RETENTION_DAYS: i64 = 36_500;
const STORAGE_TIMEOUT_MS: u64 = 2000;
const CLEANUP_INTERVAL_SECS: u64 = 3600;
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// What admission checks answer when the counter store cannot be reached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Allow the request (`allowed=true, reason=storage_error`).
    #[default]
    Open,
    /// Deny the request (`allowed=false, reason=storage_error`).
    Closed,
}

impl Display for FailMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            FailMode::Open => write!(f, "open"),
            FailMode::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for FailMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            _ => Err(anyhow::anyhow!("Invalid fail mode: {}", s)),
        }
    }
}

/// Daily limits that apply to one caller tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub total: i64,
    pub llm: i64,
}

/// Admission-control configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaConfig {
    /// When false every check answers `allowed=true, reason=disabled` without storage access.
    pub enabled: bool,
    pub daily_total_limit_free: i64,
    pub daily_total_limit_premium: i64,
    pub daily_llm_limit_free: i64,
    pub daily_request_limit_per_user: i64,
    pub daily_request_limit_per_ip: i64,
    pub max_concurrent_global: i64,
    pub max_concurrent_per_user: i64,
    pub retention_days: i64,
    pub fail_mode: FailMode,
    pub storage_timeout_ms: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_total_limit_free: DAILY_TOTAL_LIMIT_FREE,
            daily_total_limit_premium: DAILY_TOTAL_LIMIT_PREMIUM,
            daily_llm_limit_free: DAILY_LLM_LIMIT_FREE,
            daily_request_limit_per_user: DAILY_REQUEST_LIMIT_PER_USER,
            daily_request_limit_per_ip: DAILY_REQUEST_LIMIT_PER_IP,
            max_concurrent_global: MAX_CONCURRENT_GLOBAL,
            max_concurrent_per_user: MAX_CONCURRENT_PER_USER,
            retention_days: RETENTION_DAYS,
            fail_mode: FailMode::Open,
            storage_timeout_ms: STORAGE_TIMEOUT_MS,
            cleanup_interval_secs: CLEANUP_INTERVAL_SECS,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, anyhow::Error> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", name, raw)),
        _ => Ok(default),
    }
}

impl QuotaConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let fail_mode = match env::var("QUOTA_FAIL_MODE") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => FailMode::Open,
        };

        let config = Self {
            enabled: env_flag("RATE_LIMIT_ENABLED", false),
            daily_total_limit_free: env_parse("RATE_LIMIT_DAILY_PER_USER", DAILY_TOTAL_LIMIT_FREE)?,
            daily_total_limit_premium: env_parse(
                "RATE_LIMIT_DAILY_PER_USER_PREMIUM",
                DAILY_TOTAL_LIMIT_PREMIUM,
            )?,
            daily_llm_limit_free: env_parse("RATE_LIMIT_DAILY_LLM_PER_USER", DAILY_LLM_LIMIT_FREE)?,
            daily_request_limit_per_user: env_parse(
                "RATE_LIMIT_DAILY_REQUESTS_PER_USER",
                DAILY_REQUEST_LIMIT_PER_USER,
            )?,
            daily_request_limit_per_ip: env_parse(
                "RATE_LIMIT_DAILY_PER_IP",
                DAILY_REQUEST_LIMIT_PER_IP,
            )?,
            max_concurrent_global: env_parse("MAX_CONCURRENT_TASK_TREES", MAX_CONCURRENT_GLOBAL)?,
            max_concurrent_per_user: env_parse(
                "MAX_CONCURRENT_TASK_TREES_PER_USER",
                MAX_CONCURRENT_PER_USER,
            )?,
            retention_days: env_parse("QUOTA_RETENTION_DAYS", RETENTION_DAYS)?,
            fail_mode,
            storage_timeout_ms: env_parse("QUOTA_STORAGE_TIMEOUT_MS", STORAGE_TIMEOUT_MS)?,
            cleanup_interval_secs: env_parse(
                "QUOTA_CLEANUP_INTERVAL_SECS",
                CLEANUP_INTERVAL_SECS,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let limits = [
            ("RATE_LIMIT_DAILY_PER_USER", self.daily_total_limit_free),
            (
                "RATE_LIMIT_DAILY_PER_USER_PREMIUM",
                self.daily_total_limit_premium,
            ),
            ("RATE_LIMIT_DAILY_LLM_PER_USER", self.daily_llm_limit_free),
            (
                "RATE_LIMIT_DAILY_REQUESTS_PER_USER",
                self.daily_request_limit_per_user,
            ),
            ("RATE_LIMIT_DAILY_PER_IP", self.daily_request_limit_per_ip),
            ("MAX_CONCURRENT_TASK_TREES", self.max_concurrent_global),
            (
                "MAX_CONCURRENT_TASK_TREES_PER_USER",
                self.max_concurrent_per_user,
            ),
        ];
        for (name, value) in limits {
            if value < 0 {
                return Err(anyhow::anyhow!("{} must not be negative", name));
            }
        }

        if self.retention_days < 1 || self.retention_days > MAX_RETENTION_DAYS {
            return Err(anyhow::anyhow!(
                "QUOTA_RETENTION_DAYS must be between 1 and {}",
                MAX_RETENTION_DAYS
            ));
        }

        if self.storage_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "QUOTA_STORAGE_TIMEOUT_MS must be greater than zero"
            ));
        }

        if self.cleanup_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "QUOTA_CLEANUP_INTERVAL_SECS must be greater than zero"
            ));
        }

        Ok(())
    }

    /// Daily limits for a tier. Premium callers have no separate LLM sub-quota:
    /// their LLM limit equals their total limit.
    pub fn limits_for(&self, tier: Tier) -> QuotaLimits {
        match tier {
            Tier::Premium => QuotaLimits {
                total: self.daily_total_limit_premium,
                llm: self.daily_total_limit_premium,
            },
            Tier::Free => QuotaLimits {
                total: self.daily_total_limit_free,
                llm: self.daily_llm_limit_free,
            },
        }
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// PostgreSQL connection settings for the shared counter store.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub timeout_seconds: u64,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            max_connections: env_parse("DB_MAX_CONNECTIONS", MAX_CONNECTIONS)?,
            timeout_seconds: env_parse("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database_url.starts_with("postgresql://")
            && !self.database_url.starts_with("postgres://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("DB_MAX_CONNECTIONS must be greater than zero"));
        }

        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = QuotaConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.daily_total_limit_free, 10);
        assert_eq!(config.daily_total_limit_premium, 10);
        assert_eq!(config.daily_llm_limit_free, 1);
        assert_eq!(config.max_concurrent_global, 10);
        assert_eq!(config.max_concurrent_per_user, 1);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.fail_mode, FailMode::Open);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_premium_llm_limit_equals_total() {
        let config = QuotaConfig {
            daily_total_limit_premium: 25,
            ..QuotaConfig::default()
        };
        let limits = config.limits_for(Tier::Premium);
        assert_eq!(limits.total, 25);
        assert_eq!(limits.llm, 25);

        let free = config.limits_for(Tier::Free);
        assert_eq!(free.total, 10);
        assert_eq!(free.llm, 1);
    }

    #[test]
    fn test_validate_rejects_negative_limits() {
        let config = QuotaConfig {
            max_concurrent_per_user: -1,
            ..QuotaConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MAX_CONCURRENT_TASK_TREES_PER_USER"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_retention() {
        let config = QuotaConfig {
            storage_timeout_ms: 0,
            ..QuotaConfig::default()
        };
        assert!(config.validate().is_err());

        let config = QuotaConfig {
            retention_days: 0,
            ..QuotaConfig::default()
        };
        assert!(config.validate().is_err());

        let config = QuotaConfig {
            retention_days: 1_000_000_000,
            ..QuotaConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("QUOTA_RETENTION_DAYS"));

        let config = QuotaConfig {
            retention_days: MAX_RETENTION_DAYS,
            ..QuotaConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fail_mode_parsing() {
        assert_eq!("open".parse::<FailMode>().unwrap(), FailMode::Open);
        assert_eq!(" CLOSED ".parse::<FailMode>().unwrap(), FailMode::Closed);
        assert!("sometimes".parse::<FailMode>().is_err());
        assert_eq!(FailMode::Closed.to_string(), "closed");
    }

    #[test]
    fn test_database_config_requires_postgres_url() {
        let config = DatabaseConfig {
            database_url: "mysql://localhost/db".to_string(),
            max_connections: 5,
            timeout_seconds: 30,
        };
        assert!(config.validate().is_err());

        let config = DatabaseConfig {
            database_url: "postgres://localhost/db".to_string(),
            ..config
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
    }
}
