//! nodepack.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::Quantity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serializing config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid duration {0:?}")]
    Duration(String),
}

/// How candidate instance types are ranked by size inside a packing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeMetric {
    /// `sqrt(vcpus^2 + mem_gib^2)`.
    #[default]
    Euclidean,
    /// `sqrt(2^vcpus + 2^mem_gib)`, the historical ranking formula.
    Exponential,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodepackConfig {
    #[serde(default)]
    pub packing: PackingConfig,
    #[serde(default)]
    pub overhead: OverheadConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackingConfig {
    #[serde(default)]
    pub size_metric: SizeMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverheadConfig {
    /// Reserve kubelet/system overhead on every node.
    #[serde(default = "default_true")]
    pub kubelet: bool,
    #[serde(default = "default_eviction_threshold")]
    pub eviction_threshold: Quantity,
    /// Pod density assumed when an instance type does not publish `pods`.
    #[serde(default = "default_max_pods")]
    pub default_max_pods: u64,
}

impl Default for OverheadConfig {
    fn default() -> Self {
        Self {
            kubelet: true,
            eviction_threshold: default_eviction_threshold(),
            default_max_pods: default_max_pods(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub ttl: String,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.ttl)
    }

    pub fn cleanup_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.cleanup_interval)
    }
}

fn default_true() -> bool {
    true
}

fn default_eviction_threshold() -> Quantity {
    Quantity::from_mebibytes(100)
}

fn default_max_pods() -> u64 {
    110
}

fn default_ttl() -> String {
    "60s".to_string()
}

fn default_cleanup_interval() -> String {
    "10m".to_string()
}

impl NodepackConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodepackConfig = toml::from_str(content)?;
        config.cache.ttl()?;
        config.cache.cleanup_interval()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "250ms", "30s", "5m", "1h" or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::Duration(s.to_string());
    let (digits, scale_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}
