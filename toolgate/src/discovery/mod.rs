//! API discovery: the payloads the discovery endpoint returns, the client
//! trait used to fetch them, and [`DiscoveryCache`], which keeps the latest
//! snapshot around.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{BoxError, TGError};

pub mod cache;
pub mod memory;

pub use cache::DiscoveryCache;
pub use memory::InMemoryDiscovery;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryErrorKind {
    #[error("discovery request `{operation}` failed: {source}")]
    Upstream {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
}

pub type DiscoveryError = TGError<DiscoveryErrorKind>;

impl<E> From<E> for DiscoveryError
where
    E: Into<DiscoveryErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type DiscoveryResult<A> = Result<A, DiscoveryError>;

/// Source of discovery data, usually the cluster API server.
#[async_trait]
pub trait DiscoveryClient: std::fmt::Debug + Send + Sync {
    /// Resource lists for every group at its preferred version.
    async fn server_preferred_resources(&self) -> Result<Vec<ApiResourceList>, BoxError>;

    /// Every API group the server knows, with its versions.
    async fn server_groups(&self) -> Result<ApiGroupList, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    /// Plural resource name, `pods`. Subresources look like `pods/log`.
    pub name: String,
    #[serde(default)]
    pub singular_name: String,
    pub namespaced: bool,
    pub kind: String,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

impl ApiResource {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, namespaced: bool) -> Self {
        Self {
            name: name.into(),
            singular_name: String::new(),
            namespaced,
            kind: kind.into(),
            verbs: Vec::new(),
            short_names: Vec::new(),
        }
    }

    pub fn is_subresource(&self) -> bool {
        self.name.contains('/')
    }

    /// Whether `name` is this resource's plural, singular or short name,
    /// ignoring ASCII case.
    pub fn is_known_as(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.singular_name.eq_ignore_ascii_case(name)
            || self
                .short_names
                .iter()
                .any(|short| short.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceList {
    /// `v1` for the core group, `apps/v1` otherwise
    pub group_version: String,
    #[serde(default)]
    pub resources: Vec<ApiResource>,
}

impl ApiResourceList {
    pub fn new(group_version: impl Into<String>, resources: Vec<ApiResource>) -> Self {
        Self {
            group_version: group_version.into(),
            resources,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionForDiscovery {
    pub group_version: String,
    pub version: String,
}

impl GroupVersionForDiscovery {
    pub fn new(group_version: impl Into<String>) -> Self {
        let group_version = group_version.into();
        let version = split_group_version(&group_version).1.to_string();
        Self {
            group_version,
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroup {
    /// Empty for the core group
    pub name: String,
    #[serde(default)]
    pub versions: Vec<GroupVersionForDiscovery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_version: Option<GroupVersionForDiscovery>,
}

impl ApiGroup {
    /// The group's preferred `group/version`, falling back to the first one listed.
    pub fn preferred_group_version(&self) -> Option<&str> {
        self.preferred_version
            .as_ref()
            .or_else(|| self.versions.first())
            .map(|gv| gv.group_version.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiGroupList {
    #[serde(default)]
    pub groups: Vec<ApiGroup>,
}

/// Splits `apps/v1` into `("apps", "v1")` and `v1` into `("", "v1")`.
pub fn split_group_version(gv: &str) -> (&str, &str) {
    gv.split_once('/').unwrap_or(("", gv))
}

/// Everything one discovery round trip returned.
///
/// Snapshots are replaced wholesale and never modified after creation.
#[derive(Debug, Clone)]
pub struct DiscoverySnapshot {
    pub api_resource_lists: BTreeMap<String, ApiResourceList>,
    pub server_groups: ApiGroupList,
    pub fetched_at: Instant,
}

impl DiscoverySnapshot {
    pub fn new(lists: Vec<ApiResourceList>, server_groups: ApiGroupList) -> Self {
        let api_resource_lists = lists
            .into_iter()
            .map(|list| (list.group_version.clone(), list))
            .collect();
        Self {
            api_resource_lists,
            server_groups,
            fetched_at: Instant::now(),
        }
    }

    pub fn resource_list(&self, group_version: &str) -> Option<&ApiResourceList> {
        self.api_resource_lists.get(group_version)
    }

    /// Resource lists at each group's preferred version, in server group order.
    pub fn preferred_resource_lists(&self) -> impl Iterator<Item = &ApiResourceList> {
        self.server_groups
            .groups
            .iter()
            .filter_map(|group| group.preferred_group_version())
            .filter_map(|gv| self.resource_list(gv))
    }

    pub fn resource_lists(&self) -> impl Iterator<Item = &ApiResourceList> {
        self.api_resource_lists.values()
    }
}

/// A value read from a cache that may have served old data because a
/// refresh failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRead<T> {
    Fresh(T),
    Stale(T),
}

impl<T> CacheRead<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Fresh(value) | Self::Stale(value) => value,
        }
    }

    pub fn as_inner(&self) -> &T {
        match self {
            Self::Fresh(value) | Self::Stale(value) => value,
        }
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Fresh(value) => CacheRead::Fresh(f(value)),
            Self::Stale(value) => CacheRead::Stale(f(value)),
        }
    }
}
