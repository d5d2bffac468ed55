//! A [`DiscoveryClient`] that serves a fixed catalog from memory.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{ApiGroupList, ApiResourceList, DiscoveryClient};
use crate::error::BoxError;

/// Offline discovery catalog.
///
/// The catalog can be swapped at runtime, requests can be made to fail with
/// [`InMemoryDiscovery::set_failing`], and every request is counted, which is
/// how the caches above it are tested.
#[derive(Debug, Default)]
pub struct InMemoryDiscovery {
    lists: RwLock<Vec<ApiResourceList>>,
    groups: RwLock<ApiGroupList>,
    latency: Duration,
    failing: AtomicBool,
    resource_calls: AtomicUsize,
    group_calls: AtomicUsize,
}

impl InMemoryDiscovery {
    pub fn new(resources: Vec<ApiResourceList>, groups: ApiGroupList) -> Self {
        Self {
            lists: RwLock::new(resources),
            groups: RwLock::new(groups),
            ..Default::default()
        }
    }

    /// Delay every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_resources(&self, resources: Vec<ApiResourceList>) {
        *self.lists.write().unwrap_or_else(PoisonError::into_inner) = resources;
    }

    pub fn set_groups(&self, groups: ApiGroupList) {
        *self.groups.write().unwrap_or_else(PoisonError::into_inner) = groups;
    }

    /// Number of `server_preferred_resources` requests received, failed ones included.
    pub fn resource_calls(&self) -> usize {
        self.resource_calls.load(Ordering::SeqCst)
    }

    pub fn group_calls(&self) -> usize {
        self.group_calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, operation: &str) -> Result<(), BoxError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(format!("{operation}: connection refused").into());
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryClient for InMemoryDiscovery {
    async fn server_preferred_resources(&self) -> Result<Vec<ApiResourceList>, BoxError> {
        self.resource_calls.fetch_add(1, Ordering::SeqCst);
        self.respond("server_preferred_resources").await?;
        let lists = self.lists.read().unwrap_or_else(PoisonError::into_inner);
        Ok(lists.clone())
    }

    async fn server_groups(&self) -> Result<ApiGroupList, BoxError> {
        self.group_calls.fetch_add(1, Ordering::SeqCst);
        self.respond("server_groups").await?;
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        Ok(groups.clone())
    }
}
