//! Release history storage
//!
//! Rudder supports multiple storage backends:
//! - **Secrets** (default): release records in Kubernetes Secrets
//! - **ConfigMaps**: same layout in ConfigMaps
//! - **Memory**: process-local, shared between clones of the driver
//! - **Sql**: a SQLite database
//!
//! Drivers only move records by key. [`Storage`] layers the release
//! semantics on top: history, last and deployed lookups, revision numbering
//! with a per-name high-water mark, the pending-operation guard, and
//! history pruning.

mod configmaps;
mod memory;
mod secrets;
mod sql;

pub use configmaps::ConfigMapsDriver;
pub use memory::{MemoryDriver, OperationCounts};
pub use secrets::{ObjectDriver, RecordObject, SecretsDriver};
pub use sql::{SQL_CONNECTION_STRING_ENV, SqlDriver};

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use async_trait::async_trait;
use base64::Engine as _;
use rudder_core::{Release, ReleaseStatus};
use tracing::{debug, warn};

use crate::error::{KubeError, Result};

/// Environment variable naming the storage driver
pub const DRIVER_ENV: &str = "RUDDER_DRIVER";

/// Value of the `owner` label on every release record
pub const OWNER: &str = "rudder";

/// Label recording how a record body was compressed
pub const COMPRESSION_LABEL: &str = "rudder.io/compression";

/// Predicate used by [`Driver::list`]
pub type ReleaseFilter<'a> = &'a (dyn Fn(&Release) -> bool + Send + Sync);

/// Key-addressed release record persistence
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short driver name for logs
    fn name(&self) -> &'static str;

    /// Fetch a record; [`KubeError::RecordNotFound`] if absent
    async fn get(&self, key: &str) -> Result<Release>;

    /// Records whose labels contain every given pair
    async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>>;

    /// All records accepted by `filter`
    async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>>;

    /// Store a new record; [`KubeError::ReleaseAlreadyExists`] if the key is taken
    async fn create(&self, key: &str, release: &Release) -> Result<()>;

    /// Replace a record; [`KubeError::RecordNotFound`] if absent
    async fn update(&self, key: &str, release: &Release) -> Result<()>;

    /// Remove a record, returning it
    async fn delete(&self, key: &str) -> Result<Release>;

    /// Highest revision ever created for `name` (0 if none)
    async fn revision_watermark(&self, name: &str) -> Result<u32>;

    /// Raise the high-water mark to at least `revision`; never lowers it
    async fn raise_watermark(&self, name: &str, revision: u32) -> Result<()>;
}

/// Storage key of a release revision
pub fn release_key(name: &str, revision: u32) -> String {
    format!("sh.rudder.release.v1.{}.v{}", name, revision)
}

/// Storage key of a name's revision high-water mark
pub fn watermark_key(name: &str) -> String {
    format!("sh.rudder.release.v1.{}.watermark", name)
}

/// Labels stored with a release record
///
/// Custom labels from the release come first; the system labels always win.
#[must_use = "labels should be applied to records"]
pub fn record_labels(release: &Release) -> BTreeMap<String, String> {
    let mut labels = release.labels.clone();
    labels.insert("name".to_string(), release.name.clone());
    labels.insert("owner".to_string(), OWNER.to_string());
    labels.insert("status".to_string(), release.status.to_string());
    labels.insert("version".to_string(), release.version.to_string());
    labels
}

/// Whether `release` carries every label in `selector`
pub fn matches_labels(release: &Release, selector: &BTreeMap<String, String>) -> bool {
    let labels = record_labels(release);
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Compression for kube-native record bodies
    pub compression: CompressionMethod,

    /// Maximum number of revisions kept per release (0 = unlimited)
    pub max_history: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::default(),
            max_history: 10,
        }
    }
}

/// Compression method for release data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// No compression
    None,

    /// Gzip compression (Helm-compatible)
    Gzip { level: u32 },

    /// Zstd compression
    Zstd { level: i32 },
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

impl CompressionMethod {
    /// Value of the compression label
    pub fn label(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Gzip { .. } => "gzip",
            CompressionMethod::Zstd { .. } => "zstd",
        }
    }

    /// Method named by a compression label; `fallback` when absent or unknown
    pub fn from_label(label: Option<&str>, fallback: CompressionMethod) -> Self {
        match label {
            Some("none") => CompressionMethod::None,
            Some("gzip") => CompressionMethod::Gzip { level: 6 },
            Some("zstd") => CompressionMethod::Zstd { level: 3 },
            _ => fallback,
        }
    }
}

/// Compress data using the configured method
#[must_use = "compression result should be used"]
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| KubeError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd { level } => zstd::encode_all(std::io::Cursor::new(data), level)
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Decompress data
#[must_use = "decompression result should be used"]
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            Ok(decompressed)
        }
        CompressionMethod::Zstd { .. } => zstd::decode_all(std::io::Cursor::new(data))
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Encode a record for storage (JSON, compress, base64)
#[must_use = "encoded data should be used for storage"]
pub fn encode_for_storage(release: &Release, compression: CompressionMethod) -> Result<String> {
    let json = serde_json::to_vec(release)?;
    let compressed = compress(&json, compression)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

/// Decode a stored record (base64, decompress, JSON)
#[must_use = "decoded release should be used"]
pub fn decode_from_storage(data: &str, compression: CompressionMethod) -> Result<Release> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    let decompressed = decompress(&decoded, compression)?;
    Ok(serde_json::from_slice(&decompressed)?)
}

/// Named storage driver choice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Secrets,
    ConfigMaps,
    Memory,
    Sql,
}

impl DriverKind {
    /// Parse a driver name; the empty string selects Secrets
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim() {
            "" | "secret" | "secrets" => Ok(Self::Secrets),
            "configmap" | "configmaps" => Ok(Self::ConfigMaps),
            "memory" => Ok(Self::Memory),
            "sql" => Ok(Self::Sql),
            other => Err(KubeError::UnknownDriver(other.to_string())),
        }
    }

    /// Driver named by `RUDDER_DRIVER` (Secrets when unset)
    pub fn from_env() -> Result<Self> {
        Self::parse(&std::env::var(DRIVER_ENV).unwrap_or_default())
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverKind::Secrets => "secret",
            DriverKind::ConfigMaps => "configmap",
            DriverKind::Memory => "memory",
            DriverKind::Sql => "sql",
        })
    }
}

/// The driver a [`Storage`] delegates to
pub enum Backend {
    Memory(MemoryDriver),
    Secrets(SecretsDriver),
    ConfigMaps(ConfigMapsDriver),
    Sql(SqlDriver),
    /// Any other driver implementation
    Custom(Box<dyn Driver>),
}

impl Backend {
    fn driver(&self) -> &dyn Driver {
        match self {
            Backend::Memory(d) => d,
            Backend::Secrets(d) => d,
            Backend::ConfigMaps(d) => d,
            Backend::Sql(d) => d,
            Backend::Custom(d) => d.as_ref(),
        }
    }
}

/// Release history over a driver
pub struct Storage {
    backend: Backend,
    max_history: usize,
}

impl Storage {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            max_history: StorageConfig::default().max_history,
        }
    }

    /// In-memory storage, mostly for tests and dry runs
    pub fn memory() -> Self {
        Self::new(Backend::Memory(MemoryDriver::new()))
    }

    /// Keep at most `max_history` revisions per name (0 = unlimited)
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    pub fn driver(&self) -> &dyn Driver {
        self.backend.driver()
    }

    /// A specific revision
    pub async fn get(&self, name: &str, revision: u32) -> Result<Release> {
        debug!(release = name, revision, "getting release");
        self.driver()
            .get(&release_key(name, revision))
            .await
            .map_err(|e| not_found_as_release(e, name))
    }

    /// All revisions of a release, oldest first
    pub async fn history(&self, name: &str) -> Result<Vec<Release>> {
        debug!(release = name, "getting release history");
        let selector = BTreeMap::from([
            ("name".to_string(), name.to_string()),
            ("owner".to_string(), OWNER.to_string()),
        ]);
        let mut releases = self.driver().query(&selector).await?;
        if releases.is_empty() {
            return Err(KubeError::ReleaseNotFound {
                name: name.to_string(),
            });
        }
        releases.sort_by_key(|r| r.version);
        Ok(releases)
    }

    /// Highest revision of a release
    pub async fn last(&self, name: &str) -> Result<Release> {
        let mut history = self.history(name).await?;
        history.pop().ok_or_else(|| KubeError::ReleaseNotFound {
            name: name.to_string(),
        })
    }

    /// Every record accepted by `filter`
    pub async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>> {
        debug!("listing releases");
        self.driver().list(filter).await
    }

    /// Records matching all `labels`
    pub async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>> {
        self.driver().query(labels).await
    }

    /// The deployed revision of a release
    pub async fn deployed(&self, name: &str) -> Result<Release> {
        let selector = BTreeMap::from([
            ("name".to_string(), name.to_string()),
            ("owner".to_string(), OWNER.to_string()),
            ("status".to_string(), ReleaseStatus::Deployed.to_string()),
        ]);
        self.driver()
            .query(&selector)
            .await?
            .into_iter()
            .max_by_key(|r| r.version)
            .ok_or_else(|| KubeError::NoDeployedRelease {
                name: name.to_string(),
            })
    }

    /// Revision number the next record for `name` must use
    pub async fn next_revision(&self, name: &str) -> Result<u32> {
        let last = match self.last(name).await {
            Ok(release) => release.version,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        let watermark = self.driver().revision_watermark(name).await?;
        Ok(last.max(watermark) + 1)
    }

    /// Fail when the latest revision has an operation in flight
    ///
    /// This is a read followed by the caller's write, not a lock: two
    /// sessions racing on the same name can both pass.
    pub async fn ensure_not_pending(&self, name: &str) -> Result<()> {
        match self.last(name).await {
            Ok(release) if release.status.is_pending() => Err(KubeError::PendingOperation {
                name: name.to_string(),
                status: release.status.to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Store a new revision and raise the watermark
    pub async fn create(&self, release: &Release) -> Result<()> {
        debug!(name = %release.name, revision = release.version, "creating release");

        let watermark = self.driver().revision_watermark(&release.name).await?;
        if release.version <= watermark {
            return Err(KubeError::RevisionReused {
                name: release.name.clone(),
                revision: release.version,
                watermark,
            });
        }

        self.driver()
            .create(&release_key(&release.name, release.version), release)
            .await?;
        self.driver()
            .raise_watermark(&release.name, release.version)
            .await
    }

    /// Replace a revision, creating it when absent
    ///
    /// A missing revision at or below the watermark was deleted or pruned
    /// and is not brought back.
    pub async fn update(&self, release: &Release) -> Result<()> {
        debug!(name = %release.name, revision = release.version, status = %release.status, "updating release");

        let key = release_key(&release.name, release.version);
        match self.driver().update(&key, release).await {
            Err(e) if e.is_not_found() => self.create(release).await,
            other => other,
        }
    }

    /// Remove one revision
    pub async fn delete(&self, name: &str, revision: u32) -> Result<Release> {
        debug!(release = name, revision, "deleting release");
        self.driver()
            .delete(&release_key(name, revision))
            .await
            .map_err(|e| not_found_as_release(e, name))
    }

    /// Remove every revision of a release. The watermark stays.
    pub async fn delete_history(&self, name: &str) -> Result<Vec<Release>> {
        let history = match self.history(name).await {
            Ok(history) => history,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut removed = Vec::with_capacity(history.len());
        for release in history {
            removed.push(self.delete(&release.name, release.version).await?);
        }
        Ok(removed)
    }

    /// Drop the oldest superseded or failed revisions beyond `max_history`
    ///
    /// Best-effort: failures are logged. Actions call this once their final
    /// record is written, so the revision being replaced is already
    /// superseded and the newest one is never a candidate.
    pub async fn prune_history(&self, name: &str) {
        if self.max_history == 0 {
            return;
        }
        if let Err(e) = self.prune(name).await {
            warn!(release = name, "failed to prune release history: {}", e);
        }
    }

    async fn prune(&self, name: &str) -> Result<()> {
        let history = self.history(name).await?;
        if history.len() <= self.max_history {
            return Ok(());
        }

        let newest = history.last().map(|r| r.version);
        let mut excess = history.len() - self.max_history;
        for release in history.iter().filter(|r| {
            Some(r.version) != newest
                && matches!(r.status, ReleaseStatus::Superseded | ReleaseStatus::Failed)
        }) {
            if excess == 0 {
                break;
            }
            if let Err(e) = self.delete(&release.name, release.version).await {
                warn!(release = name, revision = release.version, "failed to prune release: {}", e);
                continue;
            }
            excess -= 1;
        }
        Ok(())
    }
}

fn not_found_as_release(e: KubeError, name: &str) -> KubeError {
    match e {
        KubeError::RecordNotFound { .. } => KubeError::ReleaseNotFound {
            name: name.to_string(),
        },
        other => other,
    }
}
