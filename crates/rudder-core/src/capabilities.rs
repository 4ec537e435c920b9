//! Cluster capabilities: server version and supported API versions

use std::collections::BTreeSet;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Group/versions compiled into the client, used when discovery returns
/// nothing usable (offline renders, empty inventories)
const BUILTIN_API_VERSIONS: &[&str] = &[
    "v1",
    "admissionregistration.k8s.io/v1",
    "apiextensions.k8s.io/v1",
    "apiregistration.k8s.io/v1",
    "apps/v1",
    "authentication.k8s.io/v1",
    "authorization.k8s.io/v1",
    "autoscaling/v1",
    "autoscaling/v2",
    "batch/v1",
    "certificates.k8s.io/v1",
    "coordination.k8s.io/v1",
    "discovery.k8s.io/v1",
    "events.k8s.io/v1",
    "flowcontrol.apiserver.k8s.io/v1",
    "networking.k8s.io/v1",
    "node.k8s.io/v1",
    "policy/v1",
    "rbac.authorization.k8s.io/v1",
    "scheduling.k8s.io/v1",
    "storage.k8s.io/v1",
];

/// Kubernetes server version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeVersion {
    /// Full version string as reported (e.g. `v1.31.2`)
    pub version: String,
    pub major: String,
    pub minor: String,
}

impl Default for KubeVersion {
    fn default() -> Self {
        Self {
            version: "v1.31.0".to_string(),
            major: "1".to_string(),
            minor: "31".to_string(),
        }
    }
}

impl KubeVersion {
    /// Build from a `gitVersion`-style string (`v1.31.2`, `1.29.4-gke.100`)
    pub fn new(version: &str) -> Self {
        let trimmed = version.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let major = parts.next().unwrap_or("1").to_string();
        let minor = parts
            .next()
            .map(|m| m.chars().take_while(|c| c.is_ascii_digit()).collect())
            .unwrap_or_default();

        Self {
            version: format!("v{}", trimmed),
            major,
            minor,
        }
    }

    /// Build from the separate fields the API server reports
    pub fn from_parts(git_version: &str, major: &str, minor: &str) -> Self {
        Self {
            version: git_version.to_string(),
            major: major.to_string(),
            minor: minor.to_string(),
        }
    }

    /// Parse the version as SemVer, padding a missing patch component
    pub fn semver(&self) -> Result<Version> {
        parse_loose_version(&self.version)
    }
}

impl std::fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.version)
    }
}

/// Set of `group/version` and `group/version/Kind` strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionSet(BTreeSet<String>);

impl VersionSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// The built-in set used when the cluster advertises nothing
    pub fn builtin() -> Self {
        BUILTIN_API_VERSIONS.iter().copied().collect()
    }

    /// Whether `api_version` (either form) is supported
    pub fn has(&self, api_version: &str) -> bool {
        self.0.contains(api_version)
    }

    pub fn insert(&mut self, api_version: impl Into<String>) -> bool {
        self.0.insert(api_version.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for VersionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// What the target cluster supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub kube_version: KubeVersion,
    pub api_versions: VersionSet,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            kube_version: KubeVersion::default(),
            api_versions: VersionSet::builtin(),
        }
    }
}

impl Capabilities {
    pub fn new(kube_version: KubeVersion, api_versions: VersionSet) -> Self {
        Self {
            kube_version,
            api_versions,
        }
    }

    /// Check a chart `kubeVersion` constraint against the server version
    pub fn satisfies(&self, constraint: &str) -> Result<bool> {
        is_compatible_range(constraint, &self.kube_version.version)
    }
}

fn parse_loose_version(version: &str) -> Result<Version> {
    let trimmed = version.trim().trim_start_matches('v');
    match Version::parse(trimmed) {
        Ok(v) => Ok(v),
        Err(err) => {
            // "1.29" -> "1.29.0"
            let (core, rest) = match trimmed.find(['-', '+']) {
                Some(idx) => trimmed.split_at(idx),
                None => (trimmed, ""),
            };
            if core.split('.').count() == 2 {
                Ok(Version::parse(&format!("{}.0{}", core, rest))?)
            } else {
                Err(err.into())
            }
        }
    }
}

const OPERATORS: &[&str] = &[">=", "<=", ">", "<", "=", "~", "^"];

/// Turn one `||` alternative (space or comma separated comparators, operators
/// possibly detached from their versions) into a `VersionReq`
fn parse_alternative(alternative: &str, constraint: &str) -> Result<VersionReq> {
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;

    for token in alternative
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        if OPERATORS.contains(&token) {
            pending_op = Some(token);
            continue;
        }
        let split = token
            .find(|c: char| !matches!(c, '>' | '<' | '=' | '~' | '^'))
            .unwrap_or(token.len());
        let (inline_op, version) = token.split_at(split);
        let version = version.trim_start_matches('v');

        let op = match (pending_op.take(), inline_op) {
            (_, op) if !op.is_empty() => op,
            (Some(op), _) => op,
            // a bare version is an exact match unless it is a wildcard
            (None, _) if version.contains(['*', 'x', 'X']) => "",
            (None, _) => "=",
        };
        comparators.push(format!("{}{}", op, version));
    }

    if comparators.is_empty() {
        return Err(CoreError::InvalidConstraint {
            constraint: constraint.to_string(),
            message: "empty constraint".to_string(),
        });
    }

    VersionReq::parse(&comparators.join(", ")).map_err(|e| CoreError::InvalidConstraint {
        constraint: constraint.to_string(),
        message: e.to_string(),
    })
}

/// Check whether `version` satisfies the range `constraint`
///
/// An unparsable constraint is reported as incompatible rather than as an
/// error. See [`matches_range`] for the accepted syntax.
pub fn is_compatible_range(constraint: &str, version: &str) -> Result<bool> {
    match matches_range(constraint, version) {
        Err(CoreError::InvalidConstraint { .. }) => Ok(false),
        other => other,
    }
}

/// Strict form of [`is_compatible_range`]: a malformed constraint is an error
///
/// Accepts a leading `v` on both sides, `||` alternatives, and space separated
/// comparators. A comparator carrying a pre-release (`>= 1.25.0-0`) lets
/// provider-suffixed server versions such as `v1.29.4-gke.100` match.
pub fn matches_range(constraint: &str, version: &str) -> Result<bool> {
    let version = parse_loose_version(version)?;

    for alternative in constraint.split("||") {
        let req = parse_alternative(alternative, constraint)?;

        let allows_pre = req.comparators.iter().any(|c| !c.pre.is_empty());
        let candidate = if allows_pre && !version.pre.is_empty() {
            Version::new(version.major, version.minor, version.patch)
        } else {
            version.clone()
        };

        if req.matches(&candidate) {
            return Ok(true);
        }
    }

    Ok(false)
}
