//! Configuration management for Slidegate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SlidegateError};
use crate::ratelimit::{ClockUnit, LimitConfig, OutOfOrderPolicy, Timestamp};

/// Prefix for environment variable overrides, e.g. `SLIDEGATE__LIMITER__WINDOW`.
const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for a Slidegate deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Background sweeper configuration
    #[serde(default)]
    pub sweeper: SweeperSettings,

    /// Unit of the wall clock used when callers do not supply timestamps
    #[serde(default)]
    pub clock: ClockUnit,
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Trailing window length, in clock units
    #[serde(default = "default_window")]
    pub window: Timestamp,

    /// Accepted requests allowed per key inside one window
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Handling of timestamps that go backwards for a key
    #[serde(default)]
    pub out_of_order: OutOfOrderPolicy,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_requests: default_max_requests(),
            out_of_order: OutOfOrderPolicy::default(),
        }
    }
}

impl LimiterSettings {
    /// Validate these settings into a limiter configuration.
    pub fn to_limit_config(&self) -> Result<LimitConfig> {
        Ok(LimitConfig::new(self.window, self.max_requests)?.with_out_of_order(self.out_of_order))
    }
}

fn default_window() -> Timestamp {
    30
}

fn default_max_requests() -> usize {
    3
}

/// Sweeper configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperSettings {
    /// Whether to run the background sweeper at all
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,

    /// Time between sweeps in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub interval_ms: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_ms: default_sweep_interval(),
        }
    }
}

impl SweeperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    1000
}

impl SlidegateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Later sources win: `SLIDEGATE__SWEEPER__INTERVAL_MS=250` overrides the
    /// file's `sweeper.interval_ms`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<SlidegateConfig>())
            .map_err(|e| SlidegateError::Config(format!("Failed to load configuration: {}", e)))
    }
}
