//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults for
//! everything except secrets. A `.env` file is read first if present.
//!
//! # Secrets
//!
//! - `JWT_SECRET_KEY`: HS256 signing secret, at least 32 bytes
//! - `MASTER_KEY`: keyring master secret. Only used to derive the key that
//!   protects the keyring file; never written anywhere.
//!
//! # Shared State
//!
//! - `STORE_BACKEND`: `memory` (single instance) or `redis` (multi-instance)
//! - `STORE_FAILURE_POLICY`: `fail_closed` (default) rejects requests that
//!   need the store while it is down; `fail_open` admits them and logs
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_MAX` / `RATE_LIMIT_WINDOW_SECS` / `RATE_LIMIT_STRATEGY`:
//!   global rule (max 0 disables it)
//! - `RATE_LIMIT_RULES`: per-route overrides, e.g.
//!   `/auth/refresh=5/60;/vault*=30/60/sliding;POST=50/60`

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::authz::RouteScopes;
use crate::error::{AppError, AppResult};
use crate::middleware::Stage;
use crate::ratelimit::{RateLimitPolicy, RateLimitRule, StrategyKind};
use crate::store::{StoreBackend, StoreFailurePolicy};
use crate::validation::{DEFAULT_MAX_URL_LENGTH, ValidationMode, ViolationKind};

/// Minimum HS256 secret length in bytes.
pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Route scope requirements used when `ROUTE_SCOPES` is unset.
pub const DEFAULT_ROUTE_SCOPES: &str =
    "/auth/whoami=read:profile;/vault/encrypt=write:vault;/vault/decrypt=read:vault;/admin=admin:keys";

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Token Configuration
    // =========================================================================
    /// HS256 signing secret (required, >= 32 bytes)
    pub jwt_secret: String,

    /// Access token lifetime (default: 30 minutes)
    pub access_token_ttl: Duration,

    /// Refresh token lifetime (default: 7 days)
    pub refresh_token_ttl: Duration,

    // =========================================================================
    // Encryption Configuration
    // =========================================================================
    /// Master secret protecting the keyring file (required)
    pub master_key: String,

    /// Path of the encrypted keyring (default: "encryption_keys.json")
    pub encryption_keys_file: PathBuf,

    /// Age in days after which the current DEK is rotated (default: 90, 0 = never)
    pub key_rotation_days: u32,

    // =========================================================================
    // Shared Store Configuration
    // =========================================================================
    /// Backend for revocation records and rate-limit counters (default: memory)
    pub store_backend: StoreBackend,

    /// Redis connection URL (default: "redis://127.0.0.1:6379")
    pub redis_url: String,

    /// Maximum pooled Redis connections (default: 16)
    pub redis_pool_size: usize,

    /// Upper bound on a single store round trip (default: 500ms)
    pub redis_timeout: Duration,

    /// What to do with requests that need the store while it is unreachable
    pub store_failure_policy: StoreFailurePolicy,

    /// How often expired in-memory entries are swept (default: 60s)
    pub store_sweep_interval: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Global rule plus per-route overrides
    pub rate_limit_policy: RateLimitPolicy,

    // =========================================================================
    // Input Validation Configuration
    // =========================================================================
    /// Block, monitor (log only) or off (default: block)
    pub validation_mode: ValidationMode,

    /// Enabled rule families (default: all)
    pub validation_rules: Vec<ViolationKind>,

    /// Maximum request body size in bytes (default: 1MB)
    /// Bodies are buffered up to this size for inspection
    pub max_request_body_size: usize,

    /// Maximum URI length (default: 2048)
    pub max_url_length: usize,

    // =========================================================================
    // Authentication & Authorization Configuration
    // =========================================================================
    /// Exact paths that bypass authentication.
    /// Default: ["/health", "/ready", "/auth/refresh"]
    /// Security note: Only add paths that don't expose sensitive data.
    pub auth_public_paths: Vec<String>,

    /// Path prefixes that bypass authentication (default: none)
    pub auth_public_prefixes: Vec<String>,

    /// Scopes required per route prefix
    pub route_scopes: RouteScopes,

    /// Order in which the pipeline stages run
    pub pipeline_order: Vec<Stage>,

    // =========================================================================
    // Network Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// X-Forwarded-For headers will only be trusted if the connection
    /// originates from one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (headers are trusted from any source)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("jwt_secret", &"[REDACTED]")
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("master_key", &"[REDACTED]")
            .field("encryption_keys_file", &self.encryption_keys_file)
            .field("key_rotation_days", &self.key_rotation_days)
            .field("store_backend", &self.store_backend)
            .field("redis_url", &self.redis_url)
            .field("redis_pool_size", &self.redis_pool_size)
            .field("redis_timeout", &self.redis_timeout)
            .field("store_failure_policy", &self.store_failure_policy)
            .field("store_sweep_interval", &self.store_sweep_interval)
            .field("rate_limit_policy", &self.rate_limit_policy)
            .field("validation_mode", &self.validation_mode)
            .field("validation_rules", &self.validation_rules)
            .field("max_request_body_size", &self.max_request_body_size)
            .field("max_url_length", &self.max_url_length)
            .field("auth_public_paths", &self.auth_public_paths)
            .field("auth_public_prefixes", &self.auth_public_prefixes)
            .field("route_scopes", &self.route_scopes)
            .field("pipeline_order", &self.pipeline_order)
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .field("trusted_proxies", &self.trusted_proxies)
            .field("log_level", &self.log_level)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a value cannot be parsed, a required
    /// secret is missing, or the values are inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let global_rule = RateLimitRule::new(
            Self::parse_env("RATE_LIMIT_MAX", 100u64)?,
            Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60u64)?),
            Self::parse_env("RATE_LIMIT_STRATEGY", StrategyKind::Fixed)?,
        );
        if global_rule.window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }
        let rate_limit_policy = RateLimitPolicy::parse(
            Some(global_rule),
            &env::var("RATE_LIMIT_RULES").unwrap_or_default(),
        )
        .map_err(|e| AppError::ConfigError(format!("Invalid RATE_LIMIT_RULES: {e}")))?;

        let route_scopes = RouteScopes::parse(
            &env::var("ROUTE_SCOPES").unwrap_or_else(|_| DEFAULT_ROUTE_SCOPES.to_string()),
        )
        .map_err(|e| AppError::ConfigError(format!("Invalid ROUTE_SCOPES: {e}")))?;

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,

            // Tokens
            jwt_secret: env::var("JWT_SECRET_KEY").unwrap_or_default(),
            access_token_ttl: Duration::from_secs(
                Self::parse_env("JWT_ACCESS_TOKEN_EXPIRE_MINUTES", 30u64)?.saturating_mul(60),
            ),
            refresh_token_ttl: Duration::from_secs(
                Self::parse_env("JWT_REFRESH_TOKEN_EXPIRE_DAYS", 7u64)?.saturating_mul(86_400),
            ),

            // Encryption
            master_key: env::var("MASTER_KEY").unwrap_or_default(),
            encryption_keys_file: PathBuf::from(
                env::var("ENCRYPTION_KEYS_FILE")
                    .unwrap_or_else(|_| "encryption_keys.json".to_string()),
            ),
            key_rotation_days: Self::parse_env("KEY_ROTATION_DAYS", 90)?,

            // Shared store
            store_backend: Self::parse_env("STORE_BACKEND", StoreBackend::Memory)?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            redis_pool_size: Self::parse_env("REDIS_POOL_SIZE", 16)?,
            redis_timeout: Duration::from_millis(Self::parse_env("REDIS_TIMEOUT_MS", 500)?),
            store_failure_policy: Self::parse_env(
                "STORE_FAILURE_POLICY",
                StoreFailurePolicy::FailClosed,
            )?,
            store_sweep_interval: Duration::from_secs(Self::parse_env(
                "STORE_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Rate limiting
            rate_limit_policy,

            // Input validation
            validation_mode: Self::parse_env("VALIDATION_MODE", ValidationMode::Block)?,
            validation_rules: Self::parse_validation_rules()?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?, // 1MB
            max_url_length: Self::parse_env("MAX_URL_LENGTH", DEFAULT_MAX_URL_LENGTH)?,

            // Authentication & authorization
            auth_public_paths: Self::parse_paths("AUTH_PUBLIC_PATHS", "/health,/ready,/auth/refresh"),
            auth_public_prefixes: Self::parse_paths("AUTH_PUBLIC_PREFIXES", ""),
            route_scopes,
            pipeline_order: Self::parse_pipeline_order()?,

            // Network
            cors_allowed_origins: Self::parse_cors_origins(),
            trusted_proxies: Self::parse_trusted_proxies(),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.jwt_secret.trim().is_empty() {
            return Err(AppError::ConfigError(
                "JWT_SECRET_KEY must be set".to_string(),
            ));
        }

        if self.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(AppError::ConfigError(format!(
                "JWT_SECRET_KEY must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }

        if self.master_key.is_empty() {
            return Err(AppError::ConfigError("MASTER_KEY must be set".to_string()));
        }

        if self.access_token_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "JWT_ACCESS_TOKEN_EXPIRE_MINUTES must be greater than 0".to_string(),
            ));
        }

        if self.refresh_token_ttl < self.access_token_ttl {
            return Err(AppError::ConfigError(format!(
                "Refresh token lifetime ({:?}) must be >= access token lifetime ({:?})",
                self.refresh_token_ttl, self.access_token_ttl
            )));
        }

        if self.redis_pool_size == 0 {
            return Err(AppError::ConfigError(
                "REDIS_POOL_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.redis_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "REDIS_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.store_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "STORE_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        // Validate max request body size is reasonable
        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.max_url_length == 0 {
            return Err(AppError::ConfigError(
                "MAX_URL_LENGTH must be greater than 0".to_string(),
            ));
        }

        Stage::validate_order(&self.pipeline_order)
            .map_err(|e| AppError::ConfigError(format!("Invalid PIPELINE_ORDER: {e}")))?;

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Age-based DEK rotation threshold, `None` when disabled.
    pub fn key_rotation_age(&self) -> Option<Duration> {
        (self.key_rotation_days > 0)
            .then(|| Duration::from_secs(u64::from(self.key_rotation_days) * 86_400))
    }

    /// Check if any rate limit rule is active.
    pub fn rate_limiting_enabled(&self) -> bool {
        !self.rate_limit_policy.is_empty()
    }

    /// Check if trusted proxy validation is enabled.
    ///
    /// When enabled, X-Forwarded-For headers are only trusted if the request
    /// originates from a configured trusted proxy network.
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
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) if !val.trim().is_empty() => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            _ => Ok(default),
        }
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins() -> Vec<String> {
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parse a comma-separated list of paths. Entries not starting with `/`
    /// are dropped.
    fn parse_paths(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s.starts_with('/'))
            .collect()
    }

    /// Parse trusted proxy CIDR ranges from environment variable.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    fn parse_trusted_proxies() -> Vec<String> {
        env::var("TRUSTED_PROXIES")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_validation_rules() -> AppResult<Vec<ViolationKind>> {
        match env::var("VALIDATION_RULES") {
            Ok(list) if !list.trim().is_empty() => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse()
                        .map_err(|e| AppError::ConfigError(format!("Invalid VALIDATION_RULES: {e}")))
                })
                .collect(),
            _ => Ok(ViolationKind::RULE_FAMILIES.to_vec()),
        }
    }

    fn parse_pipeline_order() -> AppResult<Vec<Stage>> {
        match env::var("PIPELINE_ORDER") {
            Ok(list) if !list.trim().is_empty() => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse()
                        .map_err(|e| AppError::ConfigError(format!("Invalid PIPELINE_ORDER: {e}")))
                })
                .collect(),
            _ => Ok(Stage::DEFAULT_ORDER.to_vec()),
        }
    }
}

/// Default configuration for testing and development.
///
/// Secrets are left empty, so this does not pass [`Config::validate`] until
/// `jwt_secret` and `master_key` are filled in. Production deployments should
/// use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Tokens
            jwt_secret: String::new(),
            access_token_ttl: Duration::from_secs(30 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 86_400),
            // Encryption
            master_key: String::new(),
            encryption_keys_file: PathBuf::from("encryption_keys.json"),
            key_rotation_days: 90,
            // Shared store
            store_backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_pool_size: 16,
            redis_timeout: Duration::from_millis(500),
            store_failure_policy: StoreFailurePolicy::FailClosed,
            store_sweep_interval: Duration::from_secs(60),
            // Rate limiting
            rate_limit_policy: RateLimitPolicy::new(Some(RateLimitRule::new(
                100,
                Duration::from_secs(60),
                StrategyKind::Fixed,
            ))),
            // Input validation
            validation_mode: ValidationMode::Block,
            validation_rules: ViolationKind::RULE_FAMILIES.to_vec(),
            max_request_body_size: 1024 * 1024, // 1MB
            max_url_length: DEFAULT_MAX_URL_LENGTH,
            // Authentication & authorization
            auth_public_paths: vec![
                "/health".to_string(),
                "/ready".to_string(),
                "/auth/refresh".to_string(),
            ],
            auth_public_prefixes: vec![],
            route_scopes: RouteScopes::parse(DEFAULT_ROUTE_SCOPES).unwrap_or_default(),
            pipeline_order: Stage::DEFAULT_ORDER.to_vec(),
            // Network
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![],
            // Observability
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}
