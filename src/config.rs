//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Rate Limiting
//!
//! Each profile reads `RATE_LIMIT_<PROFILE>_POINTS`, `RATE_LIMIT_<PROFILE>_WINDOW_SECONDS`
//! and `RATE_LIMIT_<PROFILE>_BLOCK_DURATION_SECONDS` for `<PROFILE>` in
//! `API`, `AUTH`, `TOKEN`, `FAILED_AUTH`, `UPLOAD`.
//!
//! - `DISTRIBUTED_STORE_ENABLED`: shared Redis counters (default: true)
//! - `REDIS_URL`: required when the distributed store is enabled
//! - `STORE_TIMEOUT_MS`: per-call store timeout; a timeout counts as a failure (default: 500)
//!
//! # Security Configuration
//!
//! - `ALLOWED_ORIGINS`: comma-separated CORS origins or `*` (default: `*`)
//! - `HTTPS_ONLY`: reject plain HTTP in staging/production (default: false)
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarding headers are believed
//! - `AUTH_TOKENS`: JSON array of static bearer identities

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{AppError, AppResult};
use crate::middleware::{AllowedOrigins, StaticTokenEntry};
use crate::pipeline::DEFAULT_MAX_BODY_SIZE;
use crate::rate_limit::{ProfileName, RateLimitProfile, RateLimitProfiles};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    /// Staging and production get HTTPS enforcement.
    pub fn is_production_like(self) -> bool {
        matches!(self, Environment::Staging | Environment::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment environment (default: development)
    pub environment: Environment,

    /// Maximum request body size in bytes (default: 1 MiB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Named rate-limit profiles
    pub rate_limit_profiles: RateLimitProfiles,

    /// Use the shared counter store (default: true). When false, limits are
    /// per-instance only.
    pub distributed_store_enabled: bool,

    /// Redis URL for the shared counter store
    pub redis_url: Option<String>,

    /// Timeout for a single counter store call (default: 500ms)
    pub store_timeout: Duration,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Breaker guarding the counter store
    pub circuit_breaker: CircuitBreakerConfig,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// CORS allow-list
    pub allowed_origins: AllowedOrigins,

    /// Reject plain HTTP when the environment is production-like
    pub https_only: bool,

    /// Trusted proxy CIDR ranges for address spoofing mitigation.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarding headers are always believed)
    pub trusted_proxies: Vec<String>,

    /// Static bearer identities for the built-in token verifier
    pub auth_tokens: Vec<StaticTokenEntry>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is malformed
    /// or inconsistent (e.g., non-numeric PORT, zero-point profile).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            environment: Self::parse_env("APP_ENV", Environment::Development)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", DEFAULT_MAX_BODY_SIZE)?,

            // Rate limiting
            rate_limit_profiles: Self::parse_profiles()?,
            distributed_store_enabled: Self::parse_env("DISTRIBUTED_STORE_ENABLED", true)?,
            redis_url: env::var("REDIS_URL").ok().filter(|u| !u.trim().is_empty()),
            store_timeout: Duration::from_millis(Self::parse_env("STORE_TIMEOUT_MS", 500)?),

            // Circuit breaker
            circuit_breaker: CircuitBreakerConfig::new(
                Self::parse_env("CIRCUIT_BREAKER_ERROR_THRESHOLD", 5)?,
                Duration::from_millis(Self::parse_env("CIRCUIT_BREAKER_OPEN_DURATION_MS", 30_000)?),
                Self::parse_env("CIRCUIT_BREAKER_HALF_OPEN_MAX_REQUESTS", 3)?,
                Duration::from_millis(Self::parse_env(
                    "CIRCUIT_BREAKER_MONITOR_WINDOW_MS",
                    60_000,
                )?),
            ),

            // Security
            allowed_origins: AllowedOrigins::parse(
                &env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            ),
            https_only: Self::parse_env("HTTPS_ONLY", false)?,
            trusted_proxies: Self::parse_trusted_proxies(),
            auth_tokens: Self::parse_auth_tokens()?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        if !config.distributed_store_enabled {
            warn!(
                "DISTRIBUTED_STORE_ENABLED=false: rate limits are per-instance only and are not shared across replicas"
            );
        }

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        for profile in self.rate_limit_profiles.iter() {
            let segment = profile.name.env_segment();
            if profile.points == 0 {
                return Err(AppError::ConfigError(format!(
                    "RATE_LIMIT_{segment}_POINTS must be greater than 0"
                )));
            }
            if profile.window.is_zero() {
                return Err(AppError::ConfigError(format!(
                    "RATE_LIMIT_{segment}_WINDOW_SECONDS must be greater than 0"
                )));
            }
        }

        if self.circuit_breaker.error_threshold == 0 {
            return Err(AppError::ConfigError(
                "CIRCUIT_BREAKER_ERROR_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker.half_open_max_requests == 0 {
            return Err(AppError::ConfigError(
                "CIRCUIT_BREAKER_HALF_OPEN_MAX_REQUESTS must be greater than 0".to_string(),
            ));
        }

        if self.distributed_store_enabled && self.redis_url.is_none() {
            return Err(AppError::ConfigError(
                "REDIS_URL is required when DISTRIBUTED_STORE_ENABLED=true".to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "STORE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the HTTPS stage rejects plain HTTP.
    pub fn enforce_https(&self) -> bool {
        self.https_only && self.environment.is_production_like()
    }

    /// Check if trusted proxy validation is enabled.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Read every profile, falling back to the built-in defaults per field.
    fn parse_profiles() -> AppResult<RateLimitProfiles> {
        let profile = |name: ProfileName| -> AppResult<RateLimitProfile> {
            let defaults = RateLimitProfile::default_for(name);
            let segment = name.env_segment();
            Ok(RateLimitProfile::new(
                name,
                Self::parse_env(&format!("RATE_LIMIT_{segment}_POINTS"), defaults.points)?,
                Self::parse_env(
                    &format!("RATE_LIMIT_{segment}_WINDOW_SECONDS"),
                    defaults.window.as_secs(),
                )?,
                Self::parse_env(
                    &format!("RATE_LIMIT_{segment}_BLOCK_DURATION_SECONDS"),
                    defaults.block_duration.as_secs(),
                )?,
            ))
        };

        Ok(RateLimitProfiles {
            api: profile(ProfileName::Api)?,
            auth: profile(ProfileName::Auth)?,
            token: profile(ProfileName::Token)?,
            failed_auth: profile(ProfileName::FailedAuth)?,
            upload: profile(ProfileName::Upload)?,
        })
    }

    /// Parse trusted proxy CIDR ranges from environment variable.
    ///
    /// When empty, forwarding headers are always believed, which allows
    /// address spoofing. In production, configure this to your reverse
    /// proxy's ranges.
    fn parse_trusted_proxies() -> Vec<String> {
        env::var("TRUSTED_PROXIES")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| Self::split_list(&s))
            .unwrap_or_default()
    }

    fn parse_auth_tokens() -> AppResult<Vec<StaticTokenEntry>> {
        match env::var("AUTH_TOKENS") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map_err(|e| AppError::ConfigError(format!("Invalid AUTH_TOKENS: {e}"))),
            _ => Ok(Vec::new()),
        }
    }

    fn split_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Uses the in-process limiter so no Redis is needed. Production deployments
/// should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: Environment::Development,
            max_request_body_size: DEFAULT_MAX_BODY_SIZE,
            // Rate limiting
            rate_limit_profiles: RateLimitProfiles::default(),
            distributed_store_enabled: false,
            redis_url: None,
            store_timeout: Duration::from_millis(500),
            // Circuit breaker
            circuit_breaker: CircuitBreakerConfig::default(),
            // Security
            allowed_origins: AllowedOrigins::Any,
            https_only: false,
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            auth_tokens: vec![],
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_request_body_size, 1024 * 1024);
        assert_eq!(config.rate_limit_profiles.api.points, 100);
        assert_eq!(config.circuit_breaker.error_threshold, 5);
        assert!(!config.distributed_store_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "192.168.1.1".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "192.168.1.1:8080");
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_https_enforced_only_when_production_like() {
        let config = Config {
            https_only: true,
            ..Config::default()
        };
        assert!(!config.enforce_https());

        let config = Config {
            https_only: true,
            environment: Environment::Staging,
            ..Config::default()
        };
        assert!(config.enforce_https());

        let config = Config {
            environment: Environment::Production,
            ..Config::default()
        };
        assert!(!config.enforce_https());
    }

    #[test]
    fn test_validate_zero_points() {
        let mut config = Config::default();
        config.rate_limit_profiles.upload = RateLimitProfile::new(ProfileName::Upload, 0, 60, 300);

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("RATE_LIMIT_UPLOAD_POINTS"));
    }

    #[test]
    fn test_validate_zero_window() {
        let mut config = Config::default();
        config.rate_limit_profiles.auth = RateLimitProfile::new(ProfileName::Auth, 5, 0, 900);

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("RATE_LIMIT_AUTH_WINDOW_SECONDS"));
    }

    #[test]
    fn test_validate_breaker_thresholds() {
        let mut config = Config::default();
        config.circuit_breaker.error_threshold = 0;
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("CIRCUIT_BREAKER_ERROR_THRESHOLD")
        );

        let mut config = Config::default();
        config.circuit_breaker.half_open_max_requests = 0;
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("CIRCUIT_BREAKER_HALF_OPEN_MAX_REQUESTS")
        );
    }

    #[test]
    fn test_validate_distributed_requires_redis_url() {
        let config = Config {
            distributed_store_enabled: true,
            ..Config::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("REDIS_URL"));

        let config = Config {
            distributed_store_enabled: true,
            redis_url: Some("redis://localhost:6379".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metrics_addr() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
        assert_eq!(Config::default().metrics_addr().unwrap().port(), 9090);
    }

    #[test]
    fn test_proxy_validation_follows_trusted_proxies() {
        assert!(!Config::default().proxy_validation_enabled());
        let config = Config {
            trusted_proxies: vec!["10.0.0.0/8".to_string()],
            ..Config::default()
        };
        assert!(config.proxy_validation_enabled());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            Config::split_list(" 10.0.0.0/8, ,172.16.0.0/12 "),
            vec!["10.0.0.0/8".to_string(), "172.16.0.0/12".to_string()]
        );
    }
}
