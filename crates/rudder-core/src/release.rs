//! Release records and their lifecycle status

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chart::ChartMetadata;
use crate::error::{CoreError, Result};
use crate::hook::Hook;
use crate::values::Values;

/// Longest release name accepted; leaves room for suffixes in generated names
pub const MAX_RELEASE_NAME_LEN: usize = 53;

static RELEASE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid regex")
});

/// Validate a release name (DNS-1123 subdomain, at most 53 characters)
pub fn validate_release_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| CoreError::InvalidReleaseName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(invalid(&format!(
            "name must be at most {} characters",
            MAX_RELEASE_NAME_LEN
        )));
    }
    if !RELEASE_NAME_RE.is_match(name) {
        return Err(invalid(
            "name must consist of lower case alphanumeric characters, '-' or '.', \
             and must start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

/// Status of a release revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    /// Neither deployed nor uninstalled
    Unreleased,
    /// The revision currently running in the cluster
    Deployed,
    /// Replaced by a newer revision
    Superseded,
    Failed,
    Uninstalled,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreleased => "unreleased",
            Self::Deployed => "deployed",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Uninstalled => "uninstalled",
            Self::Uninstalling => "uninstalling",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
        }
    }

    /// An operation is in flight for this revision
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unreleased" => Ok(Self::Unreleased),
            "deployed" => Ok(Self::Deployed),
            "superseded" => Ok(Self::Superseded),
            "failed" => Ok(Self::Failed),
            "uninstalled" => Ok(Self::Uninstalled),
            "uninstalling" => Ok(Self::Uninstalling),
            "pending-install" => Ok(Self::PendingInstall),
            "pending-upgrade" => Ok(Self::PendingUpgrade),
            "pending-rollback" => Ok(Self::PendingRollback),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// One revision of a named release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,

    pub namespace: String,

    /// Revision number, starting at 1
    pub version: u32,

    pub status: ReleaseStatus,

    /// Metadata of the chart this revision was rendered from
    pub chart: ChartMetadata,

    /// Values supplied for this revision
    #[serde(default)]
    pub config: Values,

    /// Rendered manifests, `# Source:` framed
    #[serde(default)]
    pub manifest: String,

    #[serde(default)]
    pub hooks: Vec<Hook>,

    /// Free-form labels attached to the stored record
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub first_deployed: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_deployed: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub notes: Option<String>,
}

impl Release {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: u32,
        chart: ChartMetadata,
        config: Values,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version,
            status: ReleaseStatus::Unreleased,
            chart,
            config,
            manifest: String::new(),
            hooks: Vec::new(),
            labels: BTreeMap::new(),
            first_deployed: Some(now),
            last_deployed: Some(now),
            deleted: None,
            description: String::new(),
            notes: None,
        }
    }

    /// Set status and description together
    pub fn set_status(&mut self, status: ReleaseStatus, description: impl Into<String>) {
        self.status = status;
        self.description = description.into();
    }

    pub fn mark_deployed(&mut self, description: impl Into<String>) {
        self.set_status(ReleaseStatus::Deployed, description);
        self.last_deployed = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl fmt::Display) {
        self.set_status(ReleaseStatus::Failed, format!("Release failed: {}", reason));
        self.last_deployed = Some(Utc::now());
    }

    pub fn mark_superseded(&mut self) {
        self.set_status(ReleaseStatus::Superseded, "Superseded");
    }

    pub fn mark_uninstalling(&mut self) {
        self.set_status(ReleaseStatus::Uninstalling, "Deletion in progress");
    }

    pub fn mark_uninstalled(&mut self) {
        self.set_status(ReleaseStatus::Uninstalled, "Uninstallation complete");
        self.deleted = Some(Utc::now());
    }
}
