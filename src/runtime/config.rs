//! Background pool configuration.
//!
//! # Configuration Precedence
//!
//! 1. **Programmatic**: fields set on a [`PoolConfig`] after construction
//! 2. **Environment variables**: `LAZY_COALESCE_*`, applied by
//!    [`PoolConfig::from_env`] / [`PoolConfig::apply_env_overrides`]
//! 3. **Defaults**: [`PoolConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `LAZY_COALESCE_MIN_THREADS` | `usize` | `min_threads` |
//! | `LAZY_COALESCE_MAX_THREADS` | `usize` | `max_threads` |
//! | `LAZY_COALESCE_IDLE_TIMEOUT_MS` | `u64` | `idle_timeout` |
//! | `LAZY_COALESCE_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use std::time::Duration;

/// Environment variable name for the minimum worker count.
pub const ENV_MIN_THREADS: &str = "LAZY_COALESCE_MIN_THREADS";
/// Environment variable name for the maximum worker count.
pub const ENV_MAX_THREADS: &str = "LAZY_COALESCE_MAX_THREADS";
/// Environment variable name for the idle retirement timeout, in milliseconds.
pub const ENV_IDLE_TIMEOUT_MS: &str = "LAZY_COALESCE_IDLE_TIMEOUT_MS";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "LAZY_COALESCE_THREAD_NAME_PREFIX";

/// Default idle timeout before retiring excess threads.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error produced while building a [`PoolConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Human-readable description of the accepted values.
        expected: &'static str,
        /// The rejected raw value.
        value: String,
    },
    /// `max_threads` was zero.
    #[error("max_threads must be at least 1")]
    ZeroMaxThreads,
    /// `thread_name_prefix` was empty.
    #[error("thread_name_prefix must not be empty")]
    EmptyThreadNamePrefix,
}

/// Configuration for a [`BackgroundPool`](super::BackgroundPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers kept alive even when idle.
    pub min_threads: usize,
    /// Upper bound on concurrently running workers.
    pub max_threads: usize,
    /// How long a worker above `min_threads` may sit idle before it retires.
    pub idle_timeout: Duration,
    /// Worker threads are named `<prefix>-worker-<n>`.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let max_threads = std::thread::available_parallelism().map_or(4, |n| n.get().max(2));
        Self {
            min_threads: 0,
            max_threads,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "lazy-coalesce".to_string(),
        }
    }
}

impl PoolConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies the `LAZY_COALESCE_*` variables that are set.
    ///
    /// Returns an error if a variable is set but contains an unparseable
    /// value; fields are left untouched in that case.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_with(|name| std::env::var(name).ok())
    }

    fn apply_overrides_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let mut next = self.clone();
        if let Some(val) = lookup(ENV_MIN_THREADS) {
            next.min_threads = parse_usize(ENV_MIN_THREADS, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_THREADS) {
            next.max_threads = parse_usize(ENV_MAX_THREADS, &val)?;
        }
        if let Some(val) = lookup(ENV_IDLE_TIMEOUT_MS) {
            next.idle_timeout = Duration::from_millis(parse_u64(ENV_IDLE_TIMEOUT_MS, &val)?);
        }
        if let Some(val) = lookup(ENV_THREAD_NAME_PREFIX) {
            next.thread_name_prefix = val;
        }
        *self = next;
        Ok(())
    }

    /// Checks the configuration for values a pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::ZeroMaxThreads);
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::EmptyThreadNamePrefix);
        }
        Ok(())
    }

    /// Clamps `max_threads` to at least `min_threads`.
    pub fn normalize(&mut self) {
        if self.max_threads < self.min_threads {
            self.max_threads = self.min_threads;
        }
    }
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "milliseconds as u64",
            value: val.to_string(),
        })
}
