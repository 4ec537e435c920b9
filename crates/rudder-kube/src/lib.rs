//! Rudder Kube - Release action engine
//!
//! This crate provides:
//! - **Actions**: Install, upgrade, rollback and uninstall over a session [`Configuration`]
//! - **Capabilities**: Cluster version and API inventory negotiation, cached per session
//! - **Manifest Sorting**: Splitting rendered output into hooks and kind-ordered manifests
//! - **Storage Drivers**: Release records in Secrets, ConfigMaps, SQLite or memory
//! - **Hooks**: Weight-ordered lifecycle hooks with delete policies
//! - **Output**: Aggregated manifest text, per-file output directories and post-renderers
//! - **Annotations**: Helm-compatible annotation parsing with Rudder extensions

pub mod actions;
pub mod annotations;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod labels;
pub mod manifest;
pub mod notes;
pub mod output;
pub mod postrender;
pub mod resources;
pub mod storage;

pub use actions::{InstallOptions, RollbackOptions, UninstallOptions, UpgradeOptions};
pub use capabilities::{ApiInventory, CapabilitiesCache, DiscoveryClient, KubeDiscovery, negotiate};
pub use client::{ClusterConnector, KubeConnector, KubeLookup};
pub use config::{Configuration, RenderOptions, RenderedRelease, Timestamper};
pub use error::{KubeError, Result};
pub use hooks::{DEFAULT_HOOK_TIMEOUT, HookRunner};
pub use labels::{DEFAULT_RELEASE_LABEL, ReleaseLabel};
pub use manifest::{INSTALL_ORDER, KindOrder, Manifest, SortedManifests, sort_manifests};
pub use output::{OutputAggregator, OutputTarget};
pub use postrender::{ExecPostRenderer, PostRenderer};
pub use resources::{FIELD_MANAGER, KubeResources, OperationSummary, ResourceClient};
pub use storage::{
    Backend, CompressionMethod, ConfigMapsDriver, Driver, DriverKind, MemoryDriver,
    SecretsDriver, SqlDriver, Storage, StorageConfig,
};
