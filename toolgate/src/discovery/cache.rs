//! Time-bounded cache of the discovery endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::{
    ApiGroupList, ApiResourceList, CacheRead, DiscoveryClient, DiscoveryErrorKind,
    DiscoveryResult, DiscoverySnapshot,
};
use crate::cache::expiry_after;
use crate::config::DiscoveryConfig;

#[derive(Debug)]
struct SnapshotState {
    snapshot: Arc<DiscoverySnapshot>,
    expires_at: Instant,
}

/// Caches the resource lists and group list behind a single TTL.
///
/// Reads check the snapshot under the shared lock. On expiry the exclusive
/// lock is taken and held for the whole upstream round trip, so concurrent
/// misses result in one request and everyone else waits for its result.
///
/// When a request fails and an older snapshot exists, that snapshot is served
/// as [`CacheRead::Stale`]. The error only reaches the caller when there is
/// nothing to fall back to, which is the case until the first successful
/// fetch and after [`DiscoveryCache::invalidate`].
#[derive(Debug)]
pub struct DiscoveryCache {
    client: Arc<dyn DiscoveryClient>,
    ttl: Duration,
    state: RwLock<Option<SnapshotState>>,
}

impl DiscoveryCache {
    pub fn new(client: Arc<dyn DiscoveryClient>, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            ttl: config.ttl,
            state: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The current snapshot, fetching a new one if it expired.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> DiscoveryResult<CacheRead<Arc<DiscoverySnapshot>>> {
        if let Some(snapshot) = self.state.read().await.as_ref().and_then(fresh_snapshot) {
            return Ok(CacheRead::Fresh(snapshot));
        }

        let mut state = self.state.write().await;
        // someone else may have refreshed while we waited for the lock
        if let Some(snapshot) = state.as_ref().and_then(fresh_snapshot) {
            return Ok(CacheRead::Fresh(snapshot));
        }

        match self.fetch().await {
            Ok(snapshot) => Ok(CacheRead::Fresh(self.store(&mut state, snapshot))),
            Err(err) => match state.as_ref() {
                Some(previous) => {
                    warn!(
                        error = %err.kind,
                        age_ms = previous.snapshot.fetched_at.elapsed().as_millis() as u64,
                        "Discovery refresh failed, serving stale snapshot"
                    );
                    Ok(CacheRead::Stale(Arc::clone(&previous.snapshot)))
                }
                None => Err(err),
            },
        }
    }

    pub async fn get_api_resources(&self) -> DiscoveryResult<CacheRead<Vec<ApiResourceList>>> {
        let read = self.snapshot().await?;
        Ok(read.map(|snap| snap.resource_lists().cloned().collect()))
    }

    pub async fn get_server_groups(&self) -> DiscoveryResult<CacheRead<ApiGroupList>> {
        let read = self.snapshot().await?;
        Ok(read.map(|snapshot| snapshot.server_groups.clone()))
    }

    /// Fetches a new snapshot regardless of age.
    ///
    /// On failure the current snapshot, if any, is kept as it was.
    pub async fn refresh(&self) -> DiscoveryResult<()> {
        self.reload().await.map(|_| ())
    }

    /// Drops the snapshot. The next read fetches with no stale fallback.
    pub async fn invalidate(&self) {
        if self.state.write().await.take().is_some() {
            debug!("Discovery snapshot invalidated");
        }
    }

    pub async fn has_snapshot(&self) -> bool {
        self.state.read().await.is_some()
    }

    #[instrument(skip(self))]
    pub(crate) async fn reload(&self) -> DiscoveryResult<Arc<DiscoverySnapshot>> {
        let mut state = self.state.write().await;
        let snapshot = self.fetch().await?;
        Ok(self.store(&mut state, snapshot))
    }

    async fn fetch(&self) -> DiscoveryResult<DiscoverySnapshot> {
        let resources = async {
            self.client
                .server_preferred_resources()
                .await
                .map_err(|source| DiscoveryErrorKind::Upstream {
                    operation: "server_preferred_resources",
                    source,
                })
        };
        let groups = async {
            self.client
                .server_groups()
                .await
                .map_err(|source| DiscoveryErrorKind::Upstream {
                    operation: "server_groups",
                    source,
                })
        };
        let (lists, groups) = tokio::try_join!(resources, groups)?;

        let snapshot = DiscoverySnapshot::new(lists, groups);
        debug!(
            resource_lists = snapshot.api_resource_lists.len(),
            groups = snapshot.server_groups.groups.len(),
            "Fetched discovery snapshot"
        );
        Ok(snapshot)
    }

    fn store(
        &self,
        state: &mut Option<SnapshotState>,
        snapshot: DiscoverySnapshot,
    ) -> Arc<DiscoverySnapshot> {
        let expires_at = expiry_after(snapshot.fetched_at, self.ttl);
        let snapshot = Arc::new(snapshot);
        *state = Some(SnapshotState {
            snapshot: Arc::clone(&snapshot),
            expires_at,
        });
        snapshot
    }
}

fn fresh_snapshot(state: &SnapshotState) -> Option<Arc<DiscoverySnapshot>> {
    (Instant::now() < state.expires_at).then(|| Arc::clone(&state.snapshot))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    use super::*;
    use crate::discovery::{ApiGroup, ApiResource, GroupVersionForDiscovery, InMemoryDiscovery};

    fn catalog() -> (Vec<ApiResourceList>, ApiGroupList) {
        let lists = vec![
            ApiResourceList::new("v1", vec![ApiResource::new("pods", "Pod", true)]),
            ApiResourceList::new(
                "apps/v1",
                vec![ApiResource::new("deployments", "Deployment", true)],
            ),
        ];
        let groups = ApiGroupList {
            groups: vec![ApiGroup {
                name: "apps".to_string(),
                versions: vec![GroupVersionForDiscovery::new("apps/v1")],
                preferred_version: Some(GroupVersionForDiscovery::new("apps/v1")),
            }],
        };
        (lists, groups)
    }

    fn setup(ttl: Duration) -> (Arc<InMemoryDiscovery>, DiscoveryCache) {
        let (lists, groups) = catalog();
        let client = Arc::new(InMemoryDiscovery::new(lists, groups));
        let cache = DiscoveryCache::new(client.clone(), &DiscoveryConfig { ttl });
        (client, cache)
    }

    #[toolgate_macros::tokio_test]
    async fn test_reads_are_served_from_snapshot() {
        let (client, cache) = setup(Duration::from_secs(60));
        assert!(!cache.has_snapshot().await);

        let resources = cache.get_api_resources().await.unwrap();
        assert!(!resources.is_stale());
        assert_eq!(resources.into_inner().len(), 2);

        let groups = cache.get_server_groups().await.unwrap().into_inner();
        assert_eq!(groups.groups[0].name, "apps");

        assert!(cache.has_snapshot().await);
        assert_eq!(client.resource_calls(), 1);
        assert_eq!(client.group_calls(), 1);
    }

    #[toolgate_macros::tokio_test]
    async fn test_expired_snapshot_is_refetched() {
        let (client, cache) = setup(Duration::from_millis(30));
        cache.snapshot().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        client.set_resources(vec![]);
        let resources = cache.get_api_resources().await.unwrap();
        assert_eq!(resources, CacheRead::Fresh(vec![]));
        assert_eq!(client.resource_calls(), 2);
    }

    #[toolgate_macros::tokio_test]
    async fn test_stale_snapshot_served_on_error() {
        let (client, cache) = setup(Duration::from_millis(30));
        let first = cache.snapshot().await.unwrap().into_inner();
        client.set_failing(true);
        sleep(Duration::from_millis(50)).await;

        let read = cache.snapshot().await.unwrap();
        assert!(read.is_stale());
        assert!(Arc::ptr_eq(&read.into_inner(), &first));

        let resources = cache.get_api_resources().await.unwrap();
        assert!(resources.is_stale());
        assert_eq!(resources.into_inner().len(), 2);

        client.set_failing(false);
        assert!(!cache.snapshot().await.unwrap().is_stale());
    }

    #[toolgate_macros::tokio_test]
    async fn test_cold_failure_propagates() {
        let (client, cache) = setup(Duration::from_secs(60));
        client.set_failing(true);

        let err = cache.get_api_resources().await.unwrap_err();
        assert!(matches!(err.kind(), DiscoveryErrorKind::Upstream { .. }));
        assert!(!cache.has_snapshot().await);
    }

    #[toolgate_macros::tokio_test]
    async fn test_concurrent_misses_share_one_fetch() {
        let (lists, groups) = catalog();
        let client = InMemoryDiscovery::new(lists, groups).with_latency(Duration::from_millis(50));
        let client = Arc::new(client);
        let config = DiscoveryConfig::default();
        let cache = Arc::new(DiscoveryCache::new(client.clone(), &config));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_api_resources().await })
            })
            .collect();
        for task in tasks {
            let read = task.await.unwrap().unwrap();
            assert_eq!(read.into_inner().len(), 2);
        }

        assert_eq!(client.resource_calls(), 1);
        assert_eq!(client.group_calls(), 1);
    }

    #[toolgate_macros::tokio_test]
    async fn test_refresh_replaces_snapshot() {
        let (client, cache) = setup(Duration::from_secs(60));
        cache.snapshot().await.unwrap();

        client.set_resources(vec![ApiResourceList::new("v1", vec![])]);
        cache.refresh().await.unwrap();

        let resources = cache.get_api_resources().await.unwrap().into_inner();
        assert_eq!(resources, vec![ApiResourceList::new("v1", vec![])]);
        assert_eq!(client.resource_calls(), 2);
    }

    #[toolgate_macros::tokio_test]
    async fn test_failed_refresh_keeps_snapshot() {
        let (client, cache) = setup(Duration::from_secs(60));
        let before = cache.snapshot().await.unwrap().into_inner();

        client.set_failing(true);
        assert!(cache.refresh().await.is_err());

        let after = cache.snapshot().await.unwrap();
        assert!(!after.is_stale());
        assert!(Arc::ptr_eq(&after.into_inner(), &before));
    }

    #[toolgate_macros::tokio_test]
    async fn test_invalidate_removes_stale_fallback() {
        let (client, cache) = setup(Duration::from_secs(60));
        cache.snapshot().await.unwrap();

        cache.invalidate().await;
        assert!(!cache.has_snapshot().await);

        client.set_failing(true);
        assert!(cache.snapshot().await.is_err());

        client.set_failing(false);
        assert!(!cache.snapshot().await.unwrap().is_stale());
        assert_eq!(client.resource_calls(), 3);
    }
}
