#![allow(dead_code)]
use std::sync::Arc;

use toolgate::{
    DiscoveryCache, GatewayCacheConfig, ResourceResolver,
    discovery::{
        ApiGroup, ApiGroupList, ApiResource, ApiResourceList, GroupVersionForDiscovery,
        InMemoryDiscovery,
    },
};

fn group(name: &str, preferred: &str, others: &[&str]) -> ApiGroup {
    let preferred = GroupVersionForDiscovery::new(preferred);
    let mut versions = vec![preferred.clone()];
    versions.extend(others.iter().map(|gv| GroupVersionForDiscovery::new(*gv)));
    ApiGroup {
        name: name.to_string(),
        versions,
        preferred_version: Some(preferred),
    }
}

/// A small cluster: core, apps, batch and a custom resource group.
pub(crate) fn cluster_catalog() -> (Vec<ApiResourceList>, ApiGroupList) {
    let lists = vec![
        ApiResourceList::new(
            "v1",
            vec![
                ApiResource::new("pods", "Pod", true),
                ApiResource::new("pods/log", "Pod", true),
                ApiResource::new("pods/exec", "PodExecOptions", true),
                ApiResource::new("services", "Service", true),
                ApiResource::new("configmaps", "ConfigMap", true),
                ApiResource::new("namespaces", "Namespace", false),
                ApiResource::new("nodes", "Node", false),
            ],
        ),
        ApiResourceList::new(
            "apps/v1",
            vec![
                ApiResource::new("deployments", "Deployment", true),
                ApiResource::new("deployments/scale", "Scale", true),
                ApiResource::new("statefulsets", "StatefulSet", true),
                ApiResource::new("daemonsets", "DaemonSet", true),
            ],
        ),
        ApiResourceList::new(
            "batch/v1",
            vec![
                ApiResource::new("jobs", "Job", true),
                ApiResource::new("cronjobs", "CronJob", true),
            ],
        ),
        ApiResourceList::new(
            "monitoring.coreos.com/v1",
            vec![
                ApiResource::new("servicemonitors", "ServiceMonitor", true),
                ApiResource::new("prometheusrules", "PrometheusRule", true),
            ],
        ),
    ];
    let groups = ApiGroupList {
        groups: vec![
            group("", "v1", &[]),
            group("apps", "apps/v1", &[]),
            group("batch", "batch/v1", &[]),
            group("monitoring.coreos.com", "monitoring.coreos.com/v1", &[]),
        ],
    };
    (lists, groups)
}

pub(crate) fn in_memory_cluster() -> Arc<InMemoryDiscovery> {
    let (lists, groups) = cluster_catalog();
    Arc::new(InMemoryDiscovery::new(lists, groups))
}

/// Discovery cache and resolver wired the way the gateway wires them.
pub(crate) fn gateway(
    client: Arc<InMemoryDiscovery>,
    config: &GatewayCacheConfig,
) -> (Arc<DiscoveryCache>, ResourceResolver) {
    let discovery = Arc::new(DiscoveryCache::new(client, &config.discovery));
    let resolver = ResourceResolver::new(Arc::clone(&discovery), &config.resolver);
    (discovery, resolver)
}
