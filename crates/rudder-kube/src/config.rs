//! Session configuration
//!
//! [`Configuration`] binds what one invocation needs: the cluster connector,
//! the release store, the negotiated capabilities and the renderer. Actions
//! are methods on it (see [`crate::actions`]).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rudder_core::{
    Capabilities, Chart, Hook, Release, ReleaseInfo, RenderContext, Values, validate_release_name,
};
use rudder_engine::Renderer;
use tracing::{debug, warn};

use crate::capabilities::{CapabilitiesCache, negotiate};
use crate::client::ClusterConnector;
use crate::error::{KubeError, Result};
use crate::labels::{ReleaseLabel, stamp_document};
use crate::manifest::{KindOrder, Manifest, sort_manifests};
use crate::notes::extract_notes;
use crate::output::{OutputAggregator, OutputTarget};
use crate::postrender::PostRenderer;
use crate::storage::{
    Backend, ConfigMapsDriver, DriverKind, SecretsDriver, SqlDriver, Storage, StorageConfig,
};

/// Clock used for release timestamps
pub type Timestamper = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Options for one render of a chart
#[derive(Clone, Default)]
pub struct RenderOptions {
    pub release_name: String,
    pub namespace: String,
    /// Revision exposed to templates
    pub revision: u32,
    pub is_upgrade: bool,
    /// Render without contacting the cluster; default capabilities are used
    /// and `lookup` finds nothing
    pub offline: bool,
    /// Emit the chart's CRD files ahead of the manifests
    pub include_crds: bool,
    /// Keep the notes of sub-charts too
    pub sub_notes: bool,
    /// Stamp this label onto supported kinds
    pub release_label: Option<ReleaseLabel>,
    pub output: OutputTarget,
    pub post_renderer: Option<Arc<dyn PostRenderer>>,
}

impl RenderOptions {
    pub fn new(release_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            release_name: release_name.into(),
            namespace: namespace.into(),
            revision: 1,
            ..Default::default()
        }
    }
}

/// Result of [`Configuration::render_resources`]
#[derive(Debug, Clone, Default)]
pub struct RenderedRelease {
    /// Hooks ordered by weight
    pub hooks: Vec<Hook>,
    /// Aggregated manifest text (empty for filesystem output)
    pub manifest: String,
    pub notes: Option<String>,
    /// Ordinary manifests in install order
    pub manifests: Vec<Manifest>,
}

/// Session-scoped context for release actions
pub struct Configuration {
    connector: Option<Arc<dyn ClusterConnector>>,
    /// Release history
    pub releases: Storage,
    capabilities: CapabilitiesCache,
    renderer: Arc<dyn Renderer>,
    timestamper: Timestamper,
    namespace: String,
    storage_config: StorageConfig,
}

impl Configuration {
    /// Offline session with in-memory storage
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            connector: None,
            releases: Storage::memory(),
            capabilities: CapabilitiesCache::new(),
            renderer,
            timestamper: Arc::new(Utc::now),
            namespace: "default".to_string(),
            storage_config: StorageConfig::default(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.releases = storage;
        self
    }

    pub fn with_storage_config(mut self, config: StorageConfig) -> Self {
        self.releases = std::mem::replace(&mut self.releases, Storage::memory())
            .with_max_history(config.max_history);
        self.storage_config = config;
        self
    }

    pub fn with_timestamper(mut self, timestamper: Timestamper) -> Self {
        self.timestamper = timestamper;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn connector(&self) -> Option<&Arc<dyn ClusterConnector>> {
        self.connector.as_ref()
    }

    pub(crate) fn require_connector(&self) -> Result<&Arc<dyn ClusterConnector>> {
        self.connector.as_ref().ok_or(KubeError::NoCluster)
    }

    /// Current time from the session clock
    pub fn now(&self) -> DateTime<Utc> {
        (self.timestamper)()
    }

    /// Select the storage driver for `namespace`
    ///
    /// Choosing Memory while the store already holds a memory driver keeps
    /// its contents and only switches the namespace.
    pub async fn init(&mut self, namespace: impl Into<String>, driver: DriverKind) -> Result<()> {
        let namespace = namespace.into();
        debug!(namespace = %namespace, driver = %driver, "initializing release storage");

        let backend = match driver {
            DriverKind::Memory => {
                if let Backend::Memory(existing) = self.releases.backend_mut() {
                    existing.set_namespace(namespace.clone());
                    self.namespace = namespace;
                    return Ok(());
                }
                let mut memory = crate::storage::MemoryDriver::new();
                memory.set_namespace(namespace.clone());
                Backend::Memory(memory)
            }
            DriverKind::Secrets => {
                let client = self.require_connector()?.kube_client().await?;
                Backend::Secrets(SecretsDriver::new(client, &namespace, &self.storage_config))
            }
            DriverKind::ConfigMaps => {
                let client = self.require_connector()?.kube_client().await?;
                Backend::ConfigMaps(ConfigMapsDriver::new(
                    client,
                    &namespace,
                    &self.storage_config,
                ))
            }
            DriverKind::Sql => Backend::Sql(SqlDriver::from_env(namespace.clone())?),
        };

        self.releases = Storage::new(backend).with_max_history(self.storage_config.max_history);
        self.namespace = namespace;
        Ok(())
    }

    /// Negotiated cluster capabilities, cached for the session
    pub async fn capabilities(&self) -> Result<Capabilities> {
        if let Some(cached) = self.capabilities.get() {
            return Ok(cached);
        }

        let discovery = self
            .require_connector()?
            .discovery()
            .await
            .map_err(|e| KubeError::Discovery {
                context: "could not get Kubernetes discovery client",
                reason: e.to_string(),
            })?;

        let capabilities = negotiate(discovery.as_ref()).await?;
        self.capabilities.store(capabilities.clone());
        Ok(capabilities)
    }

    /// Forget cached capabilities; the next call negotiates again
    pub fn invalidate_capabilities(&self) {
        self.capabilities.invalidate();
    }

    /// Render a chart into hooks, aggregated manifest text and notes
    pub async fn render_resources(
        &self,
        chart: &Chart,
        values: &Values,
        options: &RenderOptions,
    ) -> Result<RenderedRelease> {
        let capabilities = if options.offline || self.connector.is_none() {
            Capabilities::default()
        } else {
            self.capabilities().await?
        };

        if let Some(required) = &chart.metadata.kube_version
            && !capabilities.satisfies(required)?
        {
            return Err(KubeError::IncompatibleVersion {
                required: required.clone(),
                actual: capabilities.kube_version.version.clone(),
            });
        }

        let mut release_info = if options.is_upgrade {
            ReleaseInfo::for_upgrade(&options.release_name, &options.namespace, options.revision)
        } else {
            ReleaseInfo::for_install(&options.release_name, &options.namespace)
        };
        release_info.revision = options.revision.max(1);

        let context = RenderContext::new(values.clone(), release_info, &chart.metadata)
            .with_capabilities(capabilities.clone());

        let mut files = self.render_files(chart, context, options.offline).await?;

        let notes = extract_notes(&mut files, chart, options.sub_notes);
        let mut sorted = sort_manifests(&files, &capabilities.api_versions, KindOrder::Install)?;

        if let Some(label) = &options.release_label {
            for manifest in &mut sorted.manifests {
                manifest.content = stamp_document(&manifest.content, label)?;
            }
        }

        let mut output = OutputAggregator::new(options.output.clone());
        if options.include_crds {
            for crd in chart.crd_objects() {
                output.add_crd(&crd)?;
            }
        }
        for manifest in &sorted.manifests {
            output.add_manifest(manifest)?;
        }
        let manifest = output.finish(options.post_renderer.as_deref()).await?;

        Ok(RenderedRelease {
            hooks: sorted.hooks,
            manifest,
            notes,
            manifests: sorted.manifests,
        })
    }

    /// Run the renderer, with cluster lookups when a cluster is bound
    async fn render_files(
        &self,
        chart: &Chart,
        context: RenderContext,
        offline: bool,
    ) -> Result<IndexMap<String, String>> {
        let connector = match (&self.connector, offline) {
            (Some(connector), false) => connector,
            _ => return Ok(self.renderer.render(chart, &context)?),
        };

        let lookup = connector.lookup().await?;
        let renderer = Arc::clone(&self.renderer);
        let chart = chart.clone();

        // lookups block on the runtime, so render off the async workers
        let rendered = tokio::task::spawn_blocking(move || {
            renderer.render_with_lookup(&chart, &context, lookup)
        })
        .await
        .map_err(|e| KubeError::Template(format!("render task failed: {}", e)))?;

        Ok(rendered?)
    }

    /// Persist a release after a cluster mutation. Failures are logged,
    /// never returned.
    pub async fn record_release(&self, release: &Release) {
        if let Err(e) = self.releases.update(release).await {
            warn!("warning: Failed to update release {}: {}", release.name, e);
        }
    }

    /// A revision of a release; `revision` 0 selects the latest
    pub async fn release_content(&self, name: &str, revision: u32) -> Result<Release> {
        validate_release_name(name)?;
        if revision == 0 {
            return self.releases.last(name).await;
        }
        self.releases.get(name, revision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::tests::{FakeDiscovery, InventoryAnswer};
    use crate::client::tests::FakeConnector;
    use crate::storage::tests::release;
    use async_trait::async_trait;
    use rudder_core::{ChartMetadata, ReleaseStatus};
    use rudder_engine::Engine;
    use semver::Version;
    use std::sync::atomic::Ordering;

    fn engine() -> Arc<dyn Renderer> {
        Arc::new(Engine::default())
    }

    fn chart() -> Chart {
        Chart::new(ChartMetadata::new("web", Version::new(1, 0, 0)))
            .with_template(
                "deployment.yaml",
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ release.name }}\nspec:\n  selector:\n    matchLabels:\n      app: web\n  template:\n    metadata:\n      labels:\n        app: web",
            )
            .with_template(
                "service.yaml",
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: {{ release.name }}",
            )
            .with_template("NOTES.txt", "Thanks for installing {{ release.name }}")
    }

    fn offline(name: &str) -> RenderOptions {
        RenderOptions {
            offline: true,
            ..RenderOptions::new(name, "default")
        }
    }

    #[tokio::test]
    async fn test_render_resources_offline() {
        let config = Configuration::new(engine());
        let rendered = config
            .render_resources(&chart(), &Values::new(), &offline("myapp"))
            .await
            .unwrap();

        assert_eq!(rendered.notes.as_deref(), Some("Thanks for installing myapp"));
        assert!(rendered.hooks.is_empty());
        let kinds: Vec<_> = rendered.manifests.iter().map(|m| m.head.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Deployment", "Service"]);
        assert!(rendered.manifest.starts_with("---\n# Source: web/templates/deployment.yaml\n"));
        assert!(!rendered.manifest.contains("NOTES"));
    }

    #[tokio::test]
    async fn test_render_stamps_release_label() {
        let config = Configuration::new(engine());
        let options = RenderOptions {
            release_label: Some(ReleaseLabel::for_release("myapp")),
            ..offline("myapp")
        };
        let rendered = config
            .render_resources(&chart(), &Values::new(), &options)
            .await
            .unwrap();

        let deployment = &rendered.manifests[0].content;
        assert_eq!(deployment.matches("rudder.io/release: myapp").count(), 3);
        assert!(rendered.manifests[1].content.contains("rudder.io/release: myapp"));
    }

    #[tokio::test]
    async fn test_render_includes_crds_first() {
        let config = Configuration::new(engine());
        let chart = chart().with_crd(
            "widgets.yaml",
            "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition",
        );
        let options = RenderOptions {
            include_crds: true,
            ..offline("myapp")
        };
        let rendered = config
            .render_resources(&chart, &Values::new(), &options)
            .await
            .unwrap();

        assert!(rendered.manifest.starts_with("---\n# Source: web/crds/widgets.yaml\n"));
    }

    #[tokio::test]
    async fn test_render_runs_post_renderer_once() {
        struct Upper(std::sync::atomic::AtomicUsize);

        #[async_trait]
        impl PostRenderer for Upper {
            async fn run(&self, rendered: String) -> Result<String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(rendered.to_uppercase())
            }
        }

        let upper = Arc::new(Upper(std::sync::atomic::AtomicUsize::new(0)));
        let options = RenderOptions {
            post_renderer: Some(upper.clone()),
            ..offline("myapp")
        };
        let rendered = Configuration::new(engine())
            .render_resources(&chart(), &Values::new(), &options)
            .await
            .unwrap();

        assert_eq!(upper.0.load(Ordering::SeqCst), 1);
        assert!(rendered.manifest.contains("KIND: SERVICE"));
    }

    #[tokio::test]
    async fn test_incompatible_kube_version() {
        let connector = Arc::new(FakeConnector::with_version("v1.28.0"));
        let config = Configuration::new(engine()).with_connector(connector);

        let mut chart = chart();
        chart.metadata.kube_version = Some(">= 1.30.0".to_string());

        let err = config
            .render_resources(&chart, &Values::new(), &RenderOptions::new("myapp", "default"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "chart requires kubeVersion: >= 1.30.0 which is incompatible with Kubernetes v1.28.0"
        );
    }

    #[tokio::test]
    async fn test_malformed_kube_version_is_incompatible() {
        let config = Configuration::new(engine());

        let mut chart = chart();
        chart.metadata.kube_version = Some("1.x.banana".to_string());

        let err = config
            .render_resources(&chart, &Values::new(), &offline("myapp"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KubeError::IncompatibleVersion { ref required, .. } if required == "1.x.banana"
        ));
    }

    #[tokio::test]
    async fn test_render_error_carries_partial_manifest() {
        let config = Configuration::new(engine());
        let chart = Chart::new(ChartMetadata::new("web", Version::new(1, 0, 0)))
            .with_template("good.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok")
            .with_template("bad.yaml", "kind: [unclosed");

        let err = config
            .render_resources(&chart, &Values::new(), &offline("myapp"))
            .await
            .unwrap_err();
        match err {
            KubeError::Render {
                message,
                partial_manifest,
            } => {
                assert!(message.contains("web/templates/bad.yaml"));
                assert!(partial_manifest.contains("# Source: web/templates/good.yaml"));
                assert!(partial_manifest.contains("# Source: web/templates/bad.yaml"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capabilities_are_cached_until_invalidated() {
        let connector = Arc::new(FakeConnector::new());
        let config = Configuration::new(engine()).with_connector(connector.clone());

        let caps = config.capabilities().await.unwrap();
        assert_eq!(caps.kube_version.version, "v1.30.2");
        config.capabilities().await.unwrap();
        assert_eq!(connector.discovery.version_calls.load(Ordering::SeqCst), 1);

        config.invalidate_capabilities();
        config.capabilities().await.unwrap();
        assert_eq!(connector.discovery.version_calls.load(Ordering::SeqCst), 2);
        assert_eq!(connector.discovery.invalidations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_degraded_discovery_still_negotiates() {
        let mut inventory = crate::capabilities::ApiInventory::new();
        inventory.add_kind("v1", "Service");
        let connector = Arc::new(FakeConnector {
            discovery: Arc::new(FakeDiscovery::new(
                "v1.30.0",
                InventoryAnswer::Degraded(inventory, vec!["metrics.k8s.io/v1beta1".to_string()]),
            )),
            ..FakeConnector::new()
        });
        let config = Configuration::new(engine()).with_connector(connector);

        let caps = config.capabilities().await.unwrap();
        assert!(caps.api_versions.has("v1/Service"));
    }

    #[tokio::test]
    async fn test_failed_version_is_wrapped() {
        let connector = Arc::new(FakeConnector {
            discovery: Arc::new(FakeDiscovery {
                version: Err("connection refused".to_string()),
                ..FakeDiscovery::new("v1.30.0", InventoryAnswer::Fail("unused".to_string()))
            }),
            ..FakeConnector::new()
        });
        let config = Configuration::new(engine()).with_connector(connector);

        let err = config.capabilities().await.unwrap_err();
        assert!(
            err.to_string()
                .starts_with("could not get server version from Kubernetes")
        );
    }

    #[tokio::test]
    async fn test_capabilities_without_cluster() {
        let config = Configuration::new(engine());
        assert!(matches!(
            config.capabilities().await,
            Err(KubeError::NoCluster)
        ));
    }

    #[tokio::test]
    async fn test_init_memory_reuses_driver() {
        let mut config = Configuration::new(engine());
        config.init("team-a", DriverKind::Memory).await.unwrap();
        let mut rel = release("myapp", 1, ReleaseStatus::Deployed);
        rel.namespace = "team-a".to_string();
        config.releases.create(&rel).await.unwrap();

        config.init("team-b", DriverKind::Memory).await.unwrap();
        assert_eq!(config.namespace(), "team-b");
        assert!(config.releases.last("myapp").await.is_err());

        config.init("team-a", DriverKind::Memory).await.unwrap();
        assert_eq!(config.releases.last("myapp").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_init_kube_drivers_need_a_cluster() {
        let mut config = Configuration::new(engine());
        assert!(matches!(
            config.init("default", DriverKind::Secrets).await,
            Err(KubeError::NoCluster)
        ));

        config.init("default", DriverKind::Sql).await.unwrap();
        assert_eq!(config.releases.driver().name(), "sql");
    }

    #[tokio::test]
    async fn test_release_content() {
        let config = Configuration::new(engine());
        for version in 1..=2 {
            config
                .releases
                .create(&release("myapp", version, ReleaseStatus::Superseded))
                .await
                .unwrap();
        }

        assert_eq!(config.release_content("myapp", 0).await.unwrap().version, 2);
        assert_eq!(config.release_content("myapp", 1).await.unwrap().version, 1);
        assert!(config.release_content("Not_Valid", 0).await.is_err());
        assert!(
            config
                .release_content("missing", 0)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_injectable_clock() {
        let fixed = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let config = Configuration::new(engine()).with_timestamper(Arc::new(move || fixed));
        assert_eq!(config.now(), fixed);
    }
}
