//! Caching core of the toolgate API gateway.
//!
//! Handlers turn tool calls into requests against a cluster API, an alerting
//! API and a tracing API. This crate holds the caches that sit in front of
//! those upstreams:
//!
//! - [`cache`]: keyed TTL caches behind the [`cache::Cache`] trait. The
//!   backend (single-lock LRU, segmented, no-op) is picked by
//!   [`config::CachingConfig`]. [`cache::LazyCache`] memoizes a single value.
//! - [`discovery`]: the [`discovery::DiscoveryCache`], a snapshot of the API
//!   server's discovery endpoint that is refreshed after a TTL and keeps
//!   serving the previous snapshot when a refresh fails.
//! - [`resolver`]: the [`resolver::ResourceResolver`], which turns what users
//!   type (`po`, `deployments`, `Certificate`) into group, version and
//!   resource, consulting discovery only when it has to.
//!
//! Synchronous caches use `std::sync` locks and never hold them across an
//! `.await`. The discovery cache is async because filling it means a network
//! round trip, and it holds its write lock across that round trip so
//! concurrent misses wait for a single request.
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod resolver;
#[cfg(test)]
pub mod strategies;

pub use cache::{Cache, CacheBackend, CacheStats, new_cache};
pub use config::GatewayCacheConfig;
pub use discovery::{CacheRead, DiscoveryCache, DiscoveryClient};
pub use error::TGError;
pub use resolver::{ResourceId, ResourceResolver};

/// Installs a global `tracing` subscriber filtered by the `TOOLGATE_LOG`
/// environment variable, `warn` when unset.
///
/// Does nothing if a global subscriber is already installed.
#[cfg(feature = "logs")]
pub fn initialize_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_env("TOOLGATE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
}
