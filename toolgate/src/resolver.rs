//! Resolves user-supplied resource kinds (`po`, `deployments`, `Certificate`)
//! to the group, version and resource name the API server serves them under.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::{
    cache::{CacheStats, StatsCounters, expiry_after},
    config::ResolverConfig,
    discovery::{
        ApiResource, ApiResourceList, DiscoveryCache, DiscoveryError, DiscoveryErrorKind,
        DiscoverySnapshot, split_group_version,
    },
    error::TGError,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveErrorKind {
    #[error("resource kind must not be empty")]
    EmptyKind,
    #[error("no resource found for kind `{0}`")]
    NotFound(String),
    #[error("discovery unavailable: {0}")]
    Discovery(DiscoveryErrorKind),
}

pub type ResolveError = TGError<ResolveErrorKind>;

impl<E> From<E> for ResolveError
where
    E: Into<ResolveErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<DiscoveryError> for ResolveError {
    fn from(value: DiscoveryError) -> Self {
        value.map_kind(ResolveErrorKind::Discovery)
    }
}

impl ResolveError {
    /// The kind does not exist on the server. Retrying will not help.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ResolveErrorKind::NotFound(_))
    }

    /// Discovery could not be reached, so the kind could be neither found nor
    /// ruled out.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.kind, ResolveErrorKind::Discovery(_))
    }
}

pub type ResolveResult<A> = Result<A, ResolveError>;

/// Fully qualified resource, as used to build request paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Empty for the core group
    pub group: String,
    pub version: String,
    /// Plural resource name
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceId {
    pub fn from_discovery(group_version: &str, resource: &ApiResource) -> Self {
        let (group, version) = split_group_version(group_version);
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.name.clone(),
            kind: resource.kind.clone(),
            namespaced: resource.namespaced,
        }
    }

    /// `v1` or `apps/v1`
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)
    }
}

/// Maps plural, lowercase and short forms of the built-in kinds to their
/// canonical kind. Anything else is returned trimmed but otherwise untouched.
pub fn normalize_kind(kind: &str) -> String {
    let kind = kind.trim();
    let canonical = match kind.to_ascii_lowercase().as_str() {
        "po" | "pod" | "pods" => "Pod",
        "svc" | "service" | "services" => "Service",
        "deploy" | "deployment" | "deployments" => "Deployment",
        "rs" | "replicaset" | "replicasets" => "ReplicaSet",
        "sts" | "statefulset" | "statefulsets" => "StatefulSet",
        "ds" | "daemonset" | "daemonsets" => "DaemonSet",
        "job" | "jobs" => "Job",
        "cj" | "cronjob" | "cronjobs" => "CronJob",
        "cm" | "configmap" | "configmaps" => "ConfigMap",
        "secret" | "secrets" => "Secret",
        "ns" | "namespace" | "namespaces" => "Namespace",
        "no" | "node" | "nodes" => "Node",
        "ep" | "endpoints" => "Endpoints",
        "ev" | "event" | "events" => "Event",
        "sa" | "serviceaccount" | "serviceaccounts" => "ServiceAccount",
        "pv" | "persistentvolume" | "persistentvolumes" => "PersistentVolume",
        "pvc" | "persistentvolumeclaim" | "persistentvolumeclaims" => {
            "PersistentVolumeClaim"
        }
        "sc" | "storageclass" | "storageclasses" => "StorageClass",
        "ing" | "ingress" | "ingresses" => "Ingress",
        "netpol" | "networkpolicy" | "networkpolicies" => "NetworkPolicy",
        "hpa" | "horizontalpodautoscaler" | "horizontalpodautoscalers" => {
            "HorizontalPodAutoscaler"
        }
        "pdb" | "poddisruptionbudget" | "poddisruptionbudgets" => "PodDisruptionBudget",
        "role" | "roles" => "Role",
        "rolebinding" | "rolebindings" => "RoleBinding",
        "clusterrole" | "clusterroles" => "ClusterRole",
        "clusterrolebinding" | "clusterrolebindings" => "ClusterRoleBinding",
        "crd" | "crds" | "customresourcedefinition" | "customresourcedefinitions" => {
            "CustomResourceDefinition"
        }
        _ => kind,
    };
    canonical.to_string()
}

/// Memoized resolutions sharing one expiry.
#[derive(Debug)]
struct Resolutions {
    kinds: HashMap<String, ResourceId>,
    expires_at: Instant,
}

impl Resolutions {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Resolves kinds through discovery and memoizes the answers.
///
/// Lookups go through these tiers, stopping at the first match:
///
/// 1. memoized resolutions
/// 2. the cached discovery snapshot, at each group's preferred version
/// 3. the cached discovery snapshot, at any version
/// 4. a forced discovery refresh, memoizing every kind it returns
///
/// Within a snapshot a kind match always wins. Only when no resource has the
/// wanted kind is it compared with plural names, singular names and short
/// names, so `certificates` and `cert` find a custom resource whose kind is
/// `Certificate`.
///
/// The memo expires as a whole: once its TTL passes, every resolution is
/// dropped together and a new window starts. Subresources such as
/// `pods/log` are never returned.
#[derive(Debug)]
pub struct ResourceResolver {
    discovery: Arc<DiscoveryCache>,
    ttl: Duration,
    memo: RwLock<Resolutions>,
    stats: StatsCounters,
}

impl ResourceResolver {
    pub fn new(discovery: Arc<DiscoveryCache>, config: &ResolverConfig) -> Self {
        let memo = Resolutions {
            kinds: HashMap::new(),
            expires_at: expiry_after(Instant::now(), config.ttl),
        };
        Self {
            discovery,
            ttl: config.ttl,
            memo: RwLock::new(memo),
            stats: StatsCounters::default(),
        }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, kind: &str) -> ResolveResult<ResourceId> {
        if kind.trim().is_empty() {
            return Err(ResolveErrorKind::EmptyKind.into());
        }
        let canonical = normalize_kind(kind);
        let key = canonical.to_ascii_lowercase();

        if let Some(id) = self.memoized(&key) {
            trace!(%id, "Resolved kind from memo");
            self.stats.hit();
            return Ok(id);
        }
        self.stats.miss();

        let snapshot = self.discovery.snapshot().await?.into_inner();
        if let Some(id) = find_resource(&snapshot, &canonical) {
            debug!(%id, "Resolved kind from cached discovery");
            self.current().kinds.insert(key, id.clone());
            return Ok(id);
        }

        debug!("Kind missing from cached discovery, refreshing");
        let snapshot = self.discovery.reload().await?;
        match self.backfill(&snapshot, &key, &canonical) {
            Some(id) => {
                debug!(%id, "Resolved kind after discovery refresh");
                Ok(id)
            }
            None => Err(ResolveErrorKind::NotFound(canonical).into()),
        }
    }

    /// Forgets every memoized resolution.
    pub fn invalidate(&self) {
        let mut memo = self.memo.write().unwrap_or_else(PoisonError::into_inner);
        memo.kinds.clear();
        memo.expires_at = expiry_after(Instant::now(), self.ttl);
    }

    /// Number of memoized kinds, zero once the memo has expired.
    pub fn cached_kinds(&self) -> usize {
        let memo = self.memo.read().unwrap_or_else(PoisonError::into_inner);
        if memo.is_expired(Instant::now()) {
            0
        } else {
            memo.kinds.len()
        }
    }

    /// Memo hits and misses. Evictions count resolutions dropped on expiry.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn memoized(&self, key: &str) -> Option<ResourceId> {
        {
            let memo = self.memo.read().unwrap_or_else(PoisonError::into_inner);
            if !memo.is_expired(Instant::now()) {
                return memo.kinds.get(key).cloned();
            }
        }
        self.current().kinds.get(key).cloned()
    }

    /// Write access to the memo, starting a new window first if it expired.
    fn current(&self) -> RwLockWriteGuard<'_, Resolutions> {
        let mut memo = self.memo.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if memo.is_expired(now) {
            debug!(dropped = memo.kinds.len(), "Kind resolutions expired");
            self.stats.evicted(memo.kinds.len());
            memo.kinds.clear();
            memo.expires_at = expiry_after(now, self.ttl);
        }
        memo
    }

    /// Memoizes every kind in `snapshot`, preferred versions first, keeping
    /// the first resolution seen for each kind.
    ///
    /// A `wanted` that is not a kind but a resource name is looked up by name
    /// and memoized under `key` as well.
    fn backfill(
        &self,
        snapshot: &DiscoverySnapshot,
        key: &str,
        wanted: &str,
    ) -> Option<ResourceId> {
        let mut memo = self.current();
        let before = memo.kinds.len();
        let lists = snapshot
            .preferred_resource_lists()
            .chain(snapshot.resource_lists());
        for (list, resource) in resources(lists) {
            let kind = resource.kind.to_ascii_lowercase();
            if let Entry::Vacant(slot) = memo.kinds.entry(kind) {
                slot.insert(ResourceId::from_discovery(&list.group_version, resource));
            }
        }
        debug!(
            added = memo.kinds.len() - before,
            "Memoized kinds from fresh discovery"
        );

        if let Some(id) = memo.kinds.get(key) {
            return Some(id.clone());
        }
        let id = find_resource(snapshot, wanted)?;
        memo.kinds.insert(key.to_string(), id.clone());
        Some(id)
    }
}

/// Looks `wanted` up by kind, then by resource name. Each pass tries the
/// preferred versions before the others.
fn find_resource(snapshot: &DiscoverySnapshot, wanted: &str) -> Option<ResourceId> {
    let by_kind = |resource: &ApiResource| resource.kind.eq_ignore_ascii_case(wanted);
    let by_name = |resource: &ApiResource| resource.is_known_as(wanted);
    find(snapshot.preferred_resource_lists(), &by_kind)
        .or_else(|| find(snapshot.resource_lists(), &by_kind))
        .or_else(|| find(snapshot.preferred_resource_lists(), &by_name))
        .or_else(|| find(snapshot.resource_lists(), &by_name))
}

/// Every top-level resource in `lists`, paired with the list it came from.
fn resources<'a>(
    lists: impl Iterator<Item = &'a ApiResourceList>,
) -> impl Iterator<Item = (&'a ApiResourceList, &'a ApiResource)> {
    lists
        .flat_map(|list| list.resources.iter().map(move |resource| (list, resource)))
        .filter(|(_, resource)| !resource.is_subresource())
}

fn find<'a>(
    lists: impl Iterator<Item = &'a ApiResourceList>,
    predicate: impl Fn(&ApiResource) -> bool,
) -> Option<ResourceId> {
    resources(lists)
        .find(|(_, resource)| predicate(resource))
        .map(|(list, resource)| ResourceId::from_discovery(&list.group_version, resource))
}
