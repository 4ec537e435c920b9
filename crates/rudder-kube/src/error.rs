//! Error types for rudder-kube

use thiserror::Error;

use crate::capabilities::ApiInventory;

/// Result type for rudder-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while running release actions
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Invalid session configuration; the invocation cannot continue
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Cluster client configuration could not be loaded
    #[error("unable to generate config for kubernetes client: {0}")]
    ClientConfig(String),

    /// No cluster connection is bound to the session
    #[error("no cluster connection configured for this session")]
    NoCluster,

    /// Unknown storage driver name
    #[error("unknown storage driver '{0}' (expected one of: secret, configmap, memory, sql)")]
    UnknownDriver(String),

    /// No record for the release name (or name and revision)
    #[error("release: not found: {name}")]
    ReleaseNotFound { name: String },

    /// No record under a storage key
    #[error("release record '{key}' not found")]
    RecordNotFound { key: String },

    /// A record with this storage key already exists
    #[error("release record '{key}' already exists")]
    ReleaseAlreadyExists { key: String },

    /// A release by this name is still installed
    #[error("cannot re-use a name that is still in use: {name}")]
    NameInUse { name: String },

    /// The revision is not above the name's high-water mark
    #[error("revision {revision} of release '{name}' was already used (latest issued revision is {watermark})")]
    RevisionReused {
        name: String,
        revision: u32,
        watermark: u32,
    },

    /// No revision of the release is deployed
    #[error("release '{name}' has no deployed releases")]
    NoDeployedRelease { name: String },

    /// Another install/upgrade/rollback is in flight for the release
    #[error("another operation (install/upgrade/rollback) is in progress for release '{name}' ({status})")]
    PendingOperation { name: String, status: String },

    /// The chart's kubeVersion constraint does not match the cluster
    #[error("chart requires kubeVersion: {required} which is incompatible with Kubernetes {actual}")]
    IncompatibleVersion { required: String, actual: String },

    /// Rendered output could not be split into manifests.
    /// `partial_manifest` holds every non-empty rendered file for debugging.
    #[error("{message}")]
    Render {
        message: String,
        partial_manifest: String,
    },

    /// Discovery returned an incomplete inventory (e.g. an orphaned API service)
    #[error("unable to retrieve the complete list of server APIs: {}", failures.join(", "))]
    DiscoveryDegraded {
        inventory: Box<ApiInventory>,
        failures: Vec<String>,
    },

    /// Discovery failed outright
    #[error("{context}: {reason}")]
    Discovery {
        context: &'static str,
        reason: String,
    },

    /// The post-render filter failed
    #[error("error while running post render on files: {0}")]
    PostRender(String),

    /// A hook did not complete
    #[error("hook '{hook}' failed during {event}: {message}")]
    HookFailed {
        hook: String,
        event: String,
        message: String,
    },

    /// The latest revision is already uninstalled and its history is kept
    #[error("release '{name}' is already uninstalled")]
    AlreadyUninstalled { name: String },

    /// Uninstall finished but some resources could not be removed
    #[error("uninstallation of '{name}' completed with {} error(s): {}", errors.len(), errors.join("; "))]
    UninstallIncomplete { name: String, errors: Vec<String> },

    /// Rollback not possible
    #[error("cannot rollback release '{name}': {reason}")]
    RollbackNotPossible { name: String, reason: String },

    /// Template rendering error
    #[error("template error: {0}")]
    Template(String),

    /// A manifest could not be parsed or applied
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("compression error: {0}")]
    Compression(String),

    /// SQL driver error
    #[error("SQL storage error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] rudder_core::CoreError),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<rudder_engine::EngineError> for KubeError {
    fn from(e: rudder_engine::EngineError) -> Self {
        KubeError::Template(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            KubeError::ReleaseNotFound { .. } | KubeError::RecordNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Errors the session cannot recover from; callers should abort the
    /// whole invocation instead of retrying or falling back
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KubeError::Configuration(_) | KubeError::UnknownDriver(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(KubeError::UnknownDriver("etcd".to_string()).is_fatal());
        assert!(KubeError::Configuration("bad".to_string()).is_fatal());
        assert!(!KubeError::Storage("x".to_string()).is_fatal());
    }

    #[test]
    fn test_not_found_errors() {
        assert!(KubeError::ReleaseNotFound { name: "a".to_string() }.is_not_found());
        assert!(KubeError::RecordNotFound { key: "k".to_string() }.is_not_found());
        assert!(!KubeError::NameInUse { name: "a".to_string() }.is_not_found());
    }

    #[test]
    fn test_messages() {
        let err = KubeError::IncompatibleVersion {
            required: ">= 1.30.0".to_string(),
            actual: "v1.28.0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "chart requires kubeVersion: >= 1.30.0 which is incompatible with Kubernetes v1.28.0"
        );

        let err = KubeError::PostRender("exit status 1".to_string());
        assert_eq!(
            err.to_string(),
            "error while running post render on files: exit status 1"
        );
    }
}
