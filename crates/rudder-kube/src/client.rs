//! Cluster connection factory
//!
//! A [`ClusterConnector`] hands out the cluster-facing seams a session
//! needs: discovery, resource mutation, template lookups, and the raw client
//! used by the kube-native storage drivers. [`KubeConnector`] builds all of
//! them lazily from one [`kube::Client`], so a session that never touches
//! the cluster never loads a kubeconfig.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::{Client, Config};
use rudder_engine::Lookup;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::capabilities::{DiscoveryClient, KubeDiscovery};
use crate::error::{KubeError, Result};
use crate::resources::{KubeResources, ResourceClient};

/// Factory for the cluster-facing parts of a session
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Discovery for capability negotiation
    async fn discovery(&self) -> Result<Arc<dyn DiscoveryClient>>;

    /// Client that applies and deletes manifests
    async fn resources(&self) -> Result<Arc<dyn ResourceClient>>;

    /// Read access for the template `lookup` function.
    ///
    /// The returned value blocks on the runtime it was created in, so it
    /// must only be called from a blocking thread.
    async fn lookup(&self) -> Result<Arc<dyn Lookup>>;

    /// Raw client, for the Secrets and ConfigMaps storage drivers
    async fn kube_client(&self) -> Result<Client>;
}

/// [`ClusterConnector`] backed by a kubeconfig or in-cluster config
#[derive(Default)]
pub struct KubeConnector {
    /// kubeconfig context; the current context when unset
    context: Option<String>,
    client: OnceCell<Client>,
    discovery: OnceCell<Arc<KubeDiscovery>>,
    resources: OnceCell<Arc<KubeResources>>,
}

impl KubeConnector {
    /// Connect using the default kubeconfig resolution
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect through a named kubeconfig context
    pub fn with_context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            ..Self::default()
        }
    }

    /// Use an already configured client
    pub fn with_client(client: Client) -> Self {
        Self {
            client: OnceCell::new_with(Some(client)),
            ..Self::default()
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let config = match &self.context {
                    None => Config::infer()
                        .await
                        .map_err(|e| KubeError::ClientConfig(e.to_string()))?,
                    Some(context) => {
                        let kubeconfig =
                            Kubeconfig::read().map_err(|e| KubeError::ClientConfig(e.to_string()))?;
                        let options = KubeConfigOptions {
                            context: Some(context.clone()),
                            ..Default::default()
                        };
                        Config::from_custom_kubeconfig(kubeconfig, &options)
                            .await
                            .map_err(|e| KubeError::ClientConfig(e.to_string()))?
                    }
                };
                debug!(cluster = %config.cluster_url, "connecting to cluster");
                Client::try_from(config).map_err(|e| KubeError::ClientConfig(e.to_string()))
            })
            .await
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn discovery(&self) -> Result<Arc<dyn DiscoveryClient>> {
        let discovery = self
            .discovery
            .get_or_try_init(|| async {
                let client = self.client().await?.clone();
                Ok::<_, KubeError>(Arc::new(KubeDiscovery::new(client)))
            })
            .await?;
        Ok(discovery.clone())
    }

    async fn resources(&self) -> Result<Arc<dyn ResourceClient>> {
        let resources = self
            .resources
            .get_or_try_init(|| async {
                let client = self.client().await?.clone();
                Ok::<_, KubeError>(Arc::new(KubeResources::new(client).await?))
            })
            .await?;
        Ok(resources.clone())
    }

    async fn lookup(&self) -> Result<Arc<dyn Lookup>> {
        let client = self.client().await?.clone();
        Ok(Arc::new(KubeLookup::new(client, Handle::current())))
    }

    async fn kube_client(&self) -> Result<Client> {
        Ok(self.client().await?.clone())
    }
}

/// Template lookups against the live cluster
pub struct KubeLookup {
    client: Client,
    handle: Handle,
}

impl KubeLookup {
    pub fn new(client: Client, handle: Handle) -> Self {
        Self { client, handle }
    }

    async fn fetch(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<serde_json::Value> {
        let gvk = match api_version.rsplit_once('/') {
            Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
            None => GroupVersionKind::gvk("", api_version, kind),
        };
        let (resource, caps) = discovery::pinned_kind(&self.client, &gvk).await?;

        let api: Api<DynamicObject> = if caps.scope == Scope::Namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };

        if name.is_empty() {
            let list = api.list(&ListParams::default()).await?;
            return Ok(serde_json::json!({ "items": serde_json::to_value(list.items)? }));
        }

        match api.get_opt(name).await? {
            Some(obj) => Ok(serde_json::to_value(obj)?),
            None => Ok(serde_json::json!({})),
        }
    }
}

impl Lookup for KubeLookup {
    fn lookup(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<serde_json::Value, String> {
        match self
            .handle
            .block_on(self.fetch(api_version, kind, namespace, name))
        {
            Ok(found) => Ok(found),
            // unknown kinds look like missing objects to templates
            Err(e) if e.is_not_found() => Ok(serde_json::json!({})),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::tests::{FakeDiscovery, InventoryAnswer, apps_inventory};
    use crate::resources::OperationSummary;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// One recorded cluster mutation
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Apply(String),
        Delete(String),
        Wait(String),
    }

    /// Records every mutation; fails documents containing `fail_on`
    #[derive(Default)]
    pub(crate) struct FakeResources {
        pub calls: Mutex<Vec<Call>>,
        pub fail_on: Mutex<Option<String>>,
        pub failing_hooks: Mutex<Vec<String>>,
    }

    impl FakeResources {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn fail_on(&self, needle: &str) {
            *self.fail_on.lock().unwrap() = Some(needle.to_string());
        }

        pub(crate) fn fail_hook(&self, name: &str) {
            self.failing_hooks.lock().unwrap().push(name.to_string());
        }
    }

    #[async_trait]
    impl ResourceClient for FakeResources {
        async fn apply(&self, _namespace: &str, manifest: &str) -> Result<OperationSummary> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Apply(manifest.to_string()));
            let mut summary = OperationSummary::default();
            match self.fail_on.lock().unwrap().as_deref() {
                Some(needle) if manifest.contains(needle) => summary
                    .failed
                    .push((needle.to_string(), "rejected".to_string())),
                _ => summary.succeeded.push("applied".to_string()),
            }
            Ok(summary)
        }

        async fn delete(&self, _namespace: &str, manifest: &str) -> Result<OperationSummary> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Delete(manifest.to_string()));
            Ok(OperationSummary::default())
        }

        async fn wait_for_hook(
            &self,
            _namespace: &str,
            _kind: &str,
            name: &str,
            _timeout: Duration,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Wait(name.to_string()));
            if self.failing_hooks.lock().unwrap().iter().any(|h| h == name) {
                return Err(KubeError::InvalidManifest(format!("job {} failed", name)));
            }
            Ok(())
        }
    }

    /// Connector over fakes; counts every call it answers
    pub(crate) struct FakeConnector {
        pub discovery: Arc<FakeDiscovery>,
        pub resources: Arc<FakeResources>,
        pub calls: AtomicUsize,
    }

    impl FakeConnector {
        pub(crate) fn new() -> Self {
            Self::with_version("v1.30.2")
        }

        pub(crate) fn with_version(version: &str) -> Self {
            Self {
                discovery: Arc::new(FakeDiscovery::new(
                    version,
                    InventoryAnswer::Full(apps_inventory()),
                )),
                resources: Arc::new(FakeResources::default()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClusterConnector for FakeConnector {
        async fn discovery(&self) -> Result<Arc<dyn DiscoveryClient>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.discovery.clone())
        }

        async fn resources(&self) -> Result<Arc<dyn ResourceClient>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.resources.clone())
        }

        async fn lookup(&self) -> Result<Arc<dyn Lookup>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(rudder_engine::NoLookup))
        }

        async fn kube_client(&self) -> Result<Client> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(KubeError::NoCluster)
        }
    }

    #[test]
    fn test_connector_is_lazy() {
        // building a connector must not read any kubeconfig
        let connector = KubeConnector::with_context("does-not-exist");
        assert_eq!(connector.context.as_deref(), Some("does-not-exist"));
        assert!(connector.client.get().is_none());
    }
}
