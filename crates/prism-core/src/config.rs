//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Durations are written in milliseconds (`*_ms`) or seconds (`*_secs`).
//!
//! ```toml
//! [router]
//! queue_capacity = 256
//! max_payload_bytes = 4194304
//!
//! [face]
//! workers = 10
//!
//! [aggregator]
//! conflict_policy = "keep_first"
//!
//! [retry]
//! max_attempts = 5
//! base_delay = 100
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::retry::RetryPolicy;
use crate::domain::StageName;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the aggregator resolves two different concrete results for the same
/// image and stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The later result replaces the stored one.
    #[default]
    Overwrite,
    /// The stored result stays; the later one is dropped.
    KeepFirst,
    /// The later result is refused with a conflict error.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Admitted submissions waiting for the dispatcher.
    pub queue_capacity: usize,
    pub max_payload_bytes: usize,
    /// Upper bound for handing one job to one stage.
    pub dispatch_timeout_ms: u64,
    /// Hand-offs running at once for one stage.
    pub max_inflight_dispatches: usize,
    /// Submissions waiting in one stage's dispatch lane. A full lane records
    /// MISSING for that stage only.
    pub lane_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_payload_bytes: 4 * 1024 * 1024,
            dispatch_timeout_ms: 5_000,
            max_inflight_dispatches: 64,
            lane_capacity: 256,
        }
    }
}

impl RouterConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Jobs analyzed concurrently.
    pub workers: usize,
    pub queue_capacity: usize,
    pub inference_timeout_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 256,
            inference_timeout_ms: 30_000,
        }
    }
}

impl StageConfig {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub queue_capacity: usize,
    pub max_concurrent_merges: usize,
    pub conflict_policy: ConflictPolicy,
    pub max_payload_bytes: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_concurrent_merges: 32,
            conflict_policy: ConflictPolicy::Overwrite,
            max_payload_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cache entry; `None` keeps entries forever.
    pub ttl_secs: Option<u64>,
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub router: RouterConfig,
    pub face: StageConfig,
    pub agender: StageConfig,
    pub aggregator: AggregatorConfig,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn stage(&self, stage: StageName) -> &StageConfig {
        match stage {
            StageName::Face => &self.face,
            StageName::Agender => &self.agender,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(name: &str, value: usize) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
            Ok(())
        }

        positive("router.queue_capacity", self.router.queue_capacity)?;
        positive("router.max_payload_bytes", self.router.max_payload_bytes)?;
        positive("router.max_inflight_dispatches", self.router.max_inflight_dispatches)?;
        positive("router.lane_capacity", self.router.lane_capacity)?;
        if self.router.dispatch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("router.dispatch_timeout_ms must be greater than 0".into()));
        }

        for stage in StageName::ALL {
            let cfg = self.stage(stage);
            positive(&format!("{stage}.workers"), cfg.workers)?;
            positive(&format!("{stage}.queue_capacity"), cfg.queue_capacity)?;
            if cfg.inference_timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{stage}.inference_timeout_ms must be greater than 0"
                )));
            }
        }

        positive("aggregator.queue_capacity", self.aggregator.queue_capacity)?;
        positive("aggregator.max_concurrent_merges", self.aggregator.max_concurrent_merges)?;
        if self.aggregator.max_payload_bytes < self.router.max_payload_bytes {
            return Err(ConfigError::Invalid(format!(
                "aggregator.max_payload_bytes ({}) is smaller than router.max_payload_bytes ({})",
                self.aggregator.max_payload_bytes, self.router.max_payload_bytes
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be at least 1.0".into()));
        }

        Ok(())
    }
}
