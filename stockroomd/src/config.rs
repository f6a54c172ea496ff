//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Storefront order intake configuration
    pub storefront: StorefrontConfig,

    /// Fee reconciliation configuration
    pub fees: FeeConfig,

    /// Capacity of the in-process event bus
    pub event_bus_capacity: usize,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection string (`DATABASE_URL`)
    pub url: Option<String>,
    /// Pool size
    pub max_connections: u32,
}

/// Storefront order intake configuration.
#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    /// Extra attempts after a serialization conflict
    pub max_retries: u32,
    /// Base delay between attempts
    pub retry_backoff: Duration,
    /// Rate limit applied per business and client address
    pub rate_limit: RateLimitConfig,
}

/// Per-client rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Token bucket capacity; zero disables throttling
    pub burst: u32,
    /// Time for a drained bucket to refill completely
    pub window: Duration,
    /// Minimum spacing between two requests of one client
    pub min_interval: Duration,
}

/// Fee reconciliation configuration.
#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// Extra attempts after a serialization conflict
    pub max_retries: u32,
    /// Base delay between attempts
    pub retry_backoff: Duration,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let backoff = Duration::from_millis(Self::load_env("STOCKROOM_RETRY_BACKOFF_MS", 10u64)?);

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            max_connections: Self::load_env("STOCKROOM_DB_MAX_CONNECTIONS", 10u32)?,
        };

        let rate_limit = RateLimitConfig {
            burst: Self::load_env("STOCKROOM_RATE_LIMIT_BURST", 10u32)?,
            window: Duration::from_secs(Self::load_env("STOCKROOM_RATE_LIMIT_WINDOW_SECS", 60u64)?),
            min_interval: Duration::from_millis(Self::load_env(
                "STOCKROOM_RATE_LIMIT_MIN_INTERVAL_MS",
                1000u64,
            )?),
        };

        let storefront = StorefrontConfig {
            max_retries: Self::load_env("STOCKROOM_STOREFRONT_MAX_RETRIES", 2u32)?,
            retry_backoff: backoff,
            rate_limit,
        };

        let fees = FeeConfig {
            max_retries: Self::load_env("STOCKROOM_FEE_MAX_RETRIES", 3u32)?,
            retry_backoff: backoff,
        };

        let event_bus_capacity = Self::load_env("STOCKROOM_EVENT_BUS_CAPACITY", 1000usize)?;
        if event_bus_capacity == 0 {
            return Err(DaemonError::Config(
                "STOCKROOM_EVENT_BUS_CAPACITY must be positive".to_string(),
            ));
        }

        Ok(Self { database, storefront, fees, event_bus_capacity, environment })
    }

    /// Create test configuration.
    ///
    /// No backoff, and a rate limit loose enough that tests never trip it
    /// unless they configure their own.
    pub fn test() -> Self {
        Self {
            database: DatabaseConfig { url: None, max_connections: 5 },
            storefront: StorefrontConfig {
                max_retries: 2,
                retry_backoff: Duration::ZERO,
                rate_limit: RateLimitConfig {
                    burst: 10_000,
                    window: Duration::from_secs(60),
                    min_interval: Duration::ZERO,
                },
            },
            fees: FeeConfig { max_retries: 3, retry_backoff: Duration::ZERO },
            event_bus_capacity: 100,
            environment: Environment::Test,
        }
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("STOCKROOM_ENV").unwrap_or_else(|_| "development".to_string());
        env_str.parse()
    }

    fn load_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
        match env::var(key) {
            Ok(val) => val
                .trim()
                .parse::<T>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig { url: None, max_connections: 10 },
            storefront: StorefrontConfig {
                max_retries: 2,
                retry_backoff: Duration::from_millis(10),
                rate_limit: RateLimitConfig::default(),
            },
            fees: FeeConfig { max_retries: 3, retry_backoff: Duration::from_millis(10) },
            event_bus_capacity: 1000,
            environment: Environment::Development,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            window: Duration::from_secs(60),
            min_interval: Duration::from_secs(1),
        }
    }
}

impl FromStr for Environment {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid STOCKROOM_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
