use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationSecondsWithFrac, serde_as};
use thiserror::Error;

use crate::{
    cache::{CacheBackend, DEFAULT_TTL},
    error::TGError,
};

#[derive(Debug, Error)]
pub enum ConfigErrorKind {
    #[error("cannot read configuration file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

pub type ConfigError = TGError<ConfigErrorKind>;

impl<E> From<E> for ConfigError
where
    E: Into<ConfigErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type ConfigResult<A> = Result<A, ConfigError>;

/// Response caches built through [`crate::cache::new_cache`].
///
/// Durations are written as (fractional) seconds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    pub backend: CacheBackend,
    /// Upper bound on stored entries. The segmented backend splits it evenly
    /// across segments.
    pub max_entries: usize,
    /// Lifetime of entries stored with [`crate::cache::Cache::set_default`]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub default_ttl: Duration,
    /// How often the LRU backend sweeps expired entries, zero disables the sweep
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub sweep_interval: Duration,
    /// Segment count for the segmented backend, rounded up to a power of two
    pub segments: usize,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            max_entries: 1000,
            default_ttl: DEFAULT_TTL,
            sweep_interval: Duration::from_secs(60),
            segments: crate::cache::segmented::DEFAULT_SEGMENTS,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long a discovery snapshot is served before it is refreshed
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Lifetime of the whole kind resolution map. All memoized kinds expire together.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
        }
    }
}

/// Configuration of every cache the gateway builds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayCacheConfig {
    pub caching: CachingConfig,
    pub discovery: DiscoveryConfig,
    pub resolver: ResolverConfig,
}

impl GatewayCacheConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigErrorKind::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&yaml)?;
        tracing::debug!(path = %path.display(), "Loaded cache configuration");
        Ok(config)
    }
}
