//! Capability negotiation with the target cluster
//!
//! The negotiator asks the cluster for its version and for the set of
//! group/versions and kinds it serves. The result is cached for the session
//! in a [`CapabilitiesCache`] until explicitly invalidated.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rudder_core::{Capabilities, KubeVersion, VersionSet};
use tracing::{debug, warn};

use crate::error::{KubeError, Result};

/// Group/versions the server serves and the kinds under each
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiInventory {
    resources: BTreeMap<String, BTreeSet<String>>,
}

impl ApiInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group_version(&mut self, group_version: impl Into<String>) {
        self.resources.entry(group_version.into()).or_default();
    }

    pub fn add_kind(&mut self, group_version: impl Into<String>, kind: impl Into<String>) {
        self.resources
            .entry(group_version.into())
            .or_default()
            .insert(kind.into());
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Number of group/versions
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Flatten into `group/version` and `group/version/Kind` entries.
    /// An empty inventory yields the built-in set.
    pub fn to_version_set(&self) -> VersionSet {
        if self.is_empty() {
            return VersionSet::builtin();
        }

        let mut set = VersionSet::new();
        for (gv, kinds) in &self.resources {
            set.insert(gv.clone());
            for kind in kinds {
                set.insert(format!("{}/{}", gv, kind));
            }
        }
        set
    }
}

/// Discovery seam over the cluster API
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Drop any cached discovery data
    fn invalidate(&self);

    /// Server version as reported by the API server
    async fn server_version(&self) -> Result<KubeVersion>;

    /// Served group/versions and kinds.
    ///
    /// Returns [`KubeError::DiscoveryDegraded`] carrying the partial inventory
    /// when some API groups could not be listed.
    async fn server_inventory(&self) -> Result<ApiInventory>;
}

/// Negotiate capabilities with the cluster
///
/// Invalidates the discovery cache, then fetches the server version and the
/// API inventory. A degraded inventory (an API service registered but not
/// answering) is accepted with two warnings.
pub async fn negotiate(discovery: &dyn DiscoveryClient) -> Result<Capabilities> {
    discovery.invalidate();

    let kube_version = discovery
        .server_version()
        .await
        .map_err(|e| KubeError::Discovery {
            context: "could not get server version from Kubernetes",
            reason: e.to_string(),
        })?;

    let inventory = match discovery.server_inventory().await {
        Ok(inventory) => inventory,
        Err(KubeError::DiscoveryDegraded { inventory, failures }) => {
            warn!(
                "WARNING: The Kubernetes server has an orphaned API service. Server reports: {}",
                failures.join(", ")
            );
            warn!("WARNING: To fix this, kubectl delete apiservice <service-name>");
            *inventory
        }
        Err(e) => {
            return Err(KubeError::Discovery {
                context: "could not get apiVersions from Kubernetes",
                reason: e.to_string(),
            });
        }
    };

    debug!(
        version = %kube_version,
        group_versions = inventory.len(),
        "negotiated cluster capabilities"
    );

    Ok(Capabilities::new(kube_version, inventory.to_version_set()))
}

/// Session-scoped capabilities cache with an explicit refresh point
#[derive(Debug, Default)]
pub struct CapabilitiesCache {
    cached: Mutex<Option<Capabilities>>,
}

impl CapabilitiesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Capabilities> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self, capabilities: Capabilities) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(capabilities);
    }

    /// Forget the cached value; the next fetch goes to the cluster
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Discovery backed by a live `kube::Client`
pub struct KubeDiscovery {
    client: kube::Client,
    inventory: Mutex<Option<ApiInventory>>,
}

impl KubeDiscovery {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            inventory: Mutex::new(None),
        }
    }

    fn record_kinds(
        inventory: &mut ApiInventory,
        list: k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList,
    ) {
        let gv = list.group_version;
        inventory.add_group_version(gv.clone());
        // Subresources (pods/log, deployments/scale) repeat their parent's kind
        for resource in list.resources.into_iter().filter(|r| !r.name.contains('/')) {
            inventory.add_kind(gv.clone(), resource.kind);
        }
    }

    async fn fetch_inventory(&self) -> Result<(ApiInventory, Vec<String>)> {
        let mut inventory = ApiInventory::new();
        let mut failures = Vec::new();

        let core = self.client.list_core_api_versions().await?;
        for version in core.versions {
            match self.client.list_core_api_resources(&version).await {
                Ok(list) => Self::record_kinds(&mut inventory, list),
                Err(e) => failures.push(format!("{}: {}", version, e)),
            }
        }

        let groups = self.client.list_api_groups().await?;
        for group in groups.groups {
            for version in group.versions {
                match self
                    .client
                    .list_api_group_resources(&version.group_version)
                    .await
                {
                    Ok(list) => Self::record_kinds(&mut inventory, list),
                    Err(e) => {
                        inventory.add_group_version(version.group_version.clone());
                        failures.push(format!("{}: {}", version.group_version, e));
                    }
                }
            }
        }

        Ok((inventory, failures))
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscovery {
    fn invalidate(&self) {
        *self.inventory.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn server_version(&self) -> Result<KubeVersion> {
        let info = self.client.apiserver_version().await?;
        Ok(KubeVersion::from_parts(
            &info.git_version,
            &info.major,
            &info.minor,
        ))
    }

    async fn server_inventory(&self) -> Result<ApiInventory> {
        if let Some(cached) = self
            .inventory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(cached);
        }

        let (inventory, failures) = self.fetch_inventory().await?;
        if !failures.is_empty() {
            return Err(KubeError::DiscoveryDegraded {
                inventory: Box::new(inventory),
                failures,
            });
        }

        *self.inventory.lock().unwrap_or_else(PoisonError::into_inner) = Some(inventory.clone());
        Ok(inventory)
    }
}
