//! Resource services
//!
//! One [`ResourceService`] per browsable resource kind. Each binds a copy
//! of the shared client to the active project and caches list results in
//! the shared TTL cache under `"<kind>:<project>"`.

use super::fetcher;
use super::registry::ServiceRegistry;
use super::Service;
use crate::cache::{cache_key, SharedCache};
use crate::gcp::client::GcpClient;
use crate::gcp::projects;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Resource kinds the dashboard can browse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ComputeInstances,
    ComputeDisks,
    ComputeNetworks,
    ComputeFirewalls,
    GkeClusters,
    StorageBuckets,
    PubsubTopics,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        Self::ComputeInstances,
        Self::ComputeDisks,
        Self::ComputeNetworks,
        Self::ComputeFirewalls,
        Self::GkeClusters,
        Self::StorageBuckets,
        Self::PubsubTopics,
    ];

    /// Registry name and cache-key prefix
    pub fn key(&self) -> &'static str {
        match self {
            Self::ComputeInstances => "compute-instances",
            Self::ComputeDisks => "compute-disks",
            Self::ComputeNetworks => "compute-networks",
            Self::ComputeFirewalls => "compute-firewalls",
            Self::GkeClusters => "gke-clusters",
            Self::StorageBuckets => "storage-buckets",
            Self::PubsubTopics => "pubsub-topics",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ComputeInstances => "VM Instances",
            Self::ComputeDisks => "Disks",
            Self::ComputeNetworks => "VPC Networks",
            Self::ComputeFirewalls => "Firewall Rules",
            Self::GkeClusters => "GKE Clusters",
            Self::StorageBuckets => "Storage Buckets",
            Self::PubsubTopics => "Pub/Sub Topics",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    /// Field holding the item list in a list response
    pub fn response_path(&self) -> &'static str {
        match self {
            Self::GkeClusters => "clusters",
            Self::PubsubTopics => "topics",
            _ => "items",
        }
    }

    /// Zonal kinds use the aggregated API when the zone is "all"
    pub fn is_aggregated(&self, client: &GcpClient) -> bool {
        matches!(self, Self::ComputeInstances | Self::ComputeDisks) && client.zone == "all"
    }

    pub fn list_url(&self, client: &GcpClient) -> String {
        match self {
            Self::ComputeInstances | Self::ComputeDisks => {
                let resource = if *self == Self::ComputeInstances {
                    "instances"
                } else {
                    "disks"
                };
                if self.is_aggregated(client) {
                    client.compute_aggregated_url(resource)
                } else {
                    client.compute_zonal_url(resource)
                }
            }
            Self::ComputeNetworks => client.compute_global_url("networks"),
            Self::ComputeFirewalls => client.compute_global_url("firewalls"),
            Self::GkeClusters => client.container_location_url("-", "clusters"),
            Self::StorageBuckets => {
                fetcher::add_query_param(&client.storage_url("b"), "project", &client.project_id)
            }
            Self::PubsubTopics => client.pubsub_url("topics"),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Confirm a project exists and is active; remembered in the cache for `ttl`
async fn verify_project(
    client: &GcpClient,
    cache: &SharedCache,
    ttl: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let key = cache_key("project", &client.project_id);
    if cache.get(&key).is_some() {
        return Ok(());
    }

    let project = projects::get_project(client, &client.project_id, cancel)
        .await
        .with_context(|| format!("Project {} is not reachable", client.project_id))?;
    if !project.is_active() {
        anyhow::bail!("Project {} is {}", client.project_id, project.lifecycle_state);
    }

    cache.set(key, Value::String(project.lifecycle_state), ttl);
    Ok(())
}

/// Service browsing one [`ResourceKind`]
pub struct ResourceService {
    kind: ResourceKind,
    template: GcpClient,
    cache: SharedCache,
    ttl: Duration,
    /// Client bound to the current project; `None` until initialized
    bound: RwLock<Option<GcpClient>>,
}

impl ResourceService {
    pub fn new(kind: ResourceKind, template: GcpClient, cache: SharedCache, ttl: Duration) -> Self {
        Self {
            kind,
            template,
            cache,
            ttl,
            bound: RwLock::new(None),
        }
    }

    /// Verify `project_id` and swap the bound client; returns the previous one.
    /// On failure the current binding is left in place.
    async fn bind(
        &self,
        cancel: &CancellationToken,
        project_id: &str,
    ) -> Result<Option<GcpClient>> {
        let client = self.template.with_project(project_id);
        verify_project(&client, &self.cache, self.ttl, cancel).await?;
        Ok(self.bound.write().await.replace(client))
    }
}

#[async_trait]
impl Service for ResourceService {
    async fn init_service(&self, cancel: &CancellationToken, project_id: &str) -> Result<()> {
        self.bind(cancel, project_id).await.map(|_| ())
    }

    async fn reinit(&self, cancel: &CancellationToken, project_id: &str) -> Result<()> {
        if let Some(previous) = self.bind(cancel, project_id).await? {
            if previous.project_id != project_id {
                self.cache.delete(&cache_key(self.kind.key(), &previous.project_id));
            }
        }
        Ok(())
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let client = self
            .bound
            .read()
            .await
            .clone()
            .with_context(|| format!("{} is not initialized", self.kind.display_name()))?;

        let key = cache_key(self.kind.key(), &client.project_id);
        if let Some(Value::Array(items)) = self.cache.get(&key) {
            tracing::debug!("Cache hit for {}", key);
            return Ok(items);
        }

        let items = fetcher::fetch_resources(self.kind, &client, cancel)
            .await
            .with_context(|| format!("Failed to fetch {}", self.kind.display_name()))?;

        tracing::debug!("Fetched {} items for {}", items.len(), key);
        self.cache.set(key, Value::Array(items.clone()), self.ttl);

        Ok(items)
    }
}

/// Register a [`ResourceService`] factory for every [`ResourceKind`]
pub async fn register_resource_services(
    registry: &ServiceRegistry,
    client: &GcpClient,
    ttl: Duration,
) {
    for kind in ResourceKind::ALL {
        let template = client.clone();
        registry
            .register(kind.key(), move |cache| {
                let service = ResourceService::new(kind, template.clone(), cache, ttl);
                Arc::new(service) as Arc<dyn Service>
            })
            .await;
    }
}
