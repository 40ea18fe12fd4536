//! Configuration management for floodgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Top-level configuration: one limiter and the store backing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

impl FloodgateConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.limiter.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with `FLOODGATE__SECTION__FIELD`
    /// environment variables layered on top.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading floodgate configuration");

        let config: FloodgateConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("FLOODGATE").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FloodgateError::Config(e.to_string()))?;

        config.limiter.validate()?;
        Ok(config)
    }
}

/// Configuration for a single limiter instance. Immutable once the limiter
/// is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Algorithm selection and its parameters
    #[serde(default)]
    pub algorithm: AlgorithmConfig,

    /// Admit (and log) instead of failing when the store is unreachable
    #[serde(default)]
    pub fail_open_on_store_error: bool,

    /// Give the consumed unit back depending on the request outcome
    #[serde(default)]
    pub reverse_on_outcome: ReverseOnOutcome,

    /// Decisions must carry a concrete reset time
    #[serde(default = "default_true")]
    pub standard_headers: bool,

    /// Run the guard layer
    #[serde(default = "default_true")]
    pub validate: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmConfig::default(),
            fail_open_on_store_error: false,
            reverse_on_outcome: ReverseOnOutcome::default(),
            standard_headers: true,
            validate: true,
        }
    }
}

impl LimiterConfig {
    /// Create a configuration for the given algorithm with default toggles.
    pub fn new(algorithm: AlgorithmConfig) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    /// Check the numeric parameters of the configured algorithm.
    pub fn validate(&self) -> Result<()> {
        crate::ratelimit::Policy::try_from(&self.algorithm).map(|_| ())
    }
}

fn default_true() -> bool {
    true
}

/// Algorithm selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AlgorithmConfig {
    /// Count hits per aligned window.
    FixedWindow {
        /// Admissions allowed per window
        limit: u64,
        /// Window length in milliseconds
        #[serde(default)]
        window_ms: Option<u64>,
        /// Window length as a named unit (used when `window_ms` is absent)
        #[serde(default)]
        unit: Option<TimeUnit>,
    },
    /// Continuously refilled bucket of tokens.
    TokenBucket {
        /// Maximum tokens
        capacity: u64,
        /// Tokens added per second
        refill_rate_per_second: f64,
    },
    /// Continuously draining bucket.
    LeakyBucket {
        /// Maximum queued cost
        capacity: u64,
        /// Units drained per second
        leak_rate_per_second: f64,
    },
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        AlgorithmConfig::FixedWindow {
            limit: default_limit(),
            window_ms: None,
            unit: Some(TimeUnit::Minute),
        }
    }
}

fn default_limit() -> u64 {
    100
}

/// Named window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Which request outcomes give their unit back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseOnOutcome {
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
}

impl ReverseOnOutcome {
    /// Whether any outcome reverses the consumption.
    pub fn any(&self) -> bool {
        self.on_success || self.on_failure
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local state.
    #[default]
    Memory,
    /// Redis with server-side scripts.
    Redis {
        url: String,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
    /// PostgreSQL with row locks.
    Postgres {
        url: String,
        #[serde(default = "default_table")]
        table: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_conflict_retries")]
        max_conflict_retries: u32,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

fn default_prefix() -> String {
    "floodgate:".to_string()
}

fn default_table() -> String {
    "floodgate_buckets".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_conflict_retries() -> u32 {
    3
}
