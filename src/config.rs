// Configuration File Support
//
// TOML configuration for tiergate with environment variable overrides.
// Configuration files are loaded from the XDG config directory: ~/.config/tiergate/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rate_limit::fair_queue::FairQueueConfig;
use crate::rate_limit::resolver::ResolverConfig;
use crate::rate_limit::RateLimitConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Quota and tier settings
    pub rate_limit: RateLimitConfig,

    /// Tier cache settings
    pub cache: CacheConfig,

    /// Fair queue settings
    pub queue: QueueConfig,

    /// Counter store backend
    pub store: StoreConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Tier cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a resolved tier is trusted
    pub ttl_secs: u64,

    /// How long a fallback (lookup failed) binding is trusted
    pub fallback_ttl_secs: u64,

    /// Per-attempt tier lookup timeout
    pub lookup_timeout_ms: u64,

    /// Base delay before retrying a failed lookup
    pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            fallback_ttl_secs: 30,
            lookup_timeout_ms: 500,
            retry_delay_ms: 50,
        }
    }
}

impl CacheConfig {
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            fallback_ttl: Duration::from_secs(self.fallback_ttl_secs),
            lookup_timeout: Duration::from_millis(self.lookup_timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..ResolverConfig::default()
        }
    }
}

/// Fair queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum entries per tier queue
    pub max_depth: usize,

    /// Interval between background drain passes
    pub drain_interval_ms: u64,

    /// Entries drained per pass
    pub batch_size: usize,

    /// Max wait for entries enqueued without one (0 = unbounded)
    pub default_max_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 1_000,
            drain_interval_ms: 100,
            batch_size: 10,
            default_max_wait_ms: 0,
        }
    }
}

impl QueueConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn fair_queue_config(&self) -> FairQueueConfig {
        FairQueueConfig {
            max_depth: self.max_depth,
            drain_interval: self.drain_interval(),
            default_max_wait: (self.default_max_wait_ms > 0)
                .then(|| Duration::from_millis(self.default_max_wait_ms)),
            ..FairQueueConfig::default()
        }
    }
}

/// Counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend (memory, redis)
    pub backend: String,

    /// Redis URL (if backend is redis)
    pub redis_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: None,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to enable metrics collection
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or if
    /// the resulting configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            let config = Self::default().apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/tiergate/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "tiergate", "tiergate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("tiergate").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - TIERGATE_LOG_LEVEL
    /// - TIERGATE_LOG_FORMAT
    /// - TIERGATE_RATE_LIMIT_ENABLED
    /// - TIERGATE_WINDOW_SECS
    /// - TIERGATE_FAIL_OPEN
    /// - TIERGATE_CACHE_TTL_SECS
    /// - TIERGATE_QUEUE_MAX_DEPTH
    /// - TIERGATE_STORE_BACKEND
    /// - TIERGATE_REDIS_URL
    /// - TIERGATE_METRICS_ENABLED
    /// - TIERGATE_METRICS_PORT
    ///
    /// Values that do not parse, or parse to zero where zero is meaningless,
    /// are ignored.
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("TIERGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TIERGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(enabled) = std::env::var("TIERGATE_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = enabled.parse().unwrap_or(self.rate_limit.enabled);
        }
        if let Some(window) = env_positive::<u64>("TIERGATE_WINDOW_SECS") {
            self.rate_limit.window_secs = window;
        }
        if let Ok(fail_open) = std::env::var("TIERGATE_FAIL_OPEN") {
            self.rate_limit.fail_open = fail_open.parse().unwrap_or(self.rate_limit.fail_open);
        }

        if let Some(ttl) = env_positive::<u64>("TIERGATE_CACHE_TTL_SECS") {
            self.cache.ttl_secs = ttl;
        }
        if let Some(depth) = env_positive::<usize>("TIERGATE_QUEUE_MAX_DEPTH") {
            self.queue.max_depth = depth;
        }

        if let Ok(backend) = std::env::var("TIERGATE_STORE_BACKEND") {
            self.store.backend = backend;
        }
        if let Ok(url) = std::env::var("TIERGATE_REDIS_URL") {
            self.store.redis_url = Some(url);
        }

        if let Ok(enabled) = std::env::var("TIERGATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Some(port) = env_positive::<u16>("TIERGATE_METRICS_PORT") {
            self.metrics.port = port;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("Rate limit window must be at least 1 second");
        }
        if self.rate_limit.key_prefix.is_empty() {
            anyhow::bail!("Rate limit key prefix must not be empty");
        }
        self.rate_limit
            .tier_table()
            .context("Invalid tier configuration")?;

        if self.cache.ttl_secs == 0 {
            anyhow::bail!("Tier cache TTL must be > 0");
        }
        if self.cache.lookup_timeout_ms == 0 {
            anyhow::bail!("Tier lookup timeout must be > 0");
        }

        if self.queue.max_depth == 0 {
            anyhow::bail!("Queue max depth must be > 0");
        }
        if self.queue.batch_size == 0 {
            anyhow::bail!("Queue batch size must be > 0");
        }
        if self.queue.drain_interval_ms == 0 {
            anyhow::bail!("Queue drain interval must be > 0");
        }

        match self.store.backend.to_lowercase().as_str() {
            "memory" => {}
            "redis" => {
                if self.store.redis_url.is_none() {
                    anyhow::bail!("Store backend 'redis' has no redis_url configured");
                }
            }
            _ => anyhow::bail!(
                "Invalid store backend: {}. Must be 'memory' or 'redis'",
                self.store.backend
            ),
        }

        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

fn env_positive<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(name)
        .ok()?
        .parse::<T>()
        .ok()
        .filter(|v| *v > T::default())
}
