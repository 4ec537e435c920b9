//! Chart model
//!
//! A chart is the templated bundle a release is rendered from. Loading charts
//! from disk or archives happens elsewhere; this module only describes the
//! in-memory shape the renderer and the action engine consume.

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::values::Values;

/// Directory holding the templates of a chart
pub const TEMPLATES_DIR: &str = "templates";

/// Directory holding the CRD files of a chart
pub const CRDS_DIR: &str = "crds";

/// Directory holding the sub-charts of a chart
pub const CHARTS_DIR: &str = "charts";

/// Chart metadata (the parsed `Chart.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name (required)
    pub name: String,

    /// Chart version (required, SemVer)
    #[serde(with = "version_serde")]
    pub version: Version,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Application version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    /// Kubernetes version constraint (e.g. ">= 1.25.0-0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_version: Option<String>,
}

impl ChartMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            app_version: None,
            kube_version: None,
        }
    }
}

/// A file belonging to a chart, addressed relative to the chart root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFile {
    /// Path relative to the chart root (e.g. `templates/deployment.yaml`)
    pub name: String,

    /// Raw file content
    pub data: String,
}

impl ChartFile {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A CRD file together with the full path of its owning chart
#[derive(Debug, Clone)]
pub struct CrdObject<'a> {
    /// Path relative to the owning chart (`crds/foo.yaml`)
    pub name: &'a str,

    /// Path including the chart path (`parent/charts/child/crds/foo.yaml`)
    pub filename: String,

    /// The file itself
    pub file: &'a ChartFile,
}

/// A chart with its templates, default values, sub-charts and CRD files
#[derive(Debug, Clone)]
pub struct Chart {
    pub metadata: ChartMetadata,

    /// Template files (names start with `templates/`)
    pub templates: Vec<ChartFile>,

    /// Default values (`values.yaml`)
    pub values: Values,

    /// Vendored sub-charts
    pub dependencies: Vec<Chart>,

    /// CRD files (names start with `crds/`)
    pub crds: Vec<ChartFile>,

    /// Full path of the parent chart, set when attached as a dependency
    parent_path: Option<String>,
}

impl Chart {
    /// Create an empty chart with the given metadata
    pub fn new(metadata: ChartMetadata) -> Self {
        Self {
            metadata,
            templates: Vec::new(),
            values: Values::new(),
            dependencies: Vec::new(),
            crds: Vec::new(),
            parent_path: None,
        }
    }

    /// Chart name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Add a template file (`name` is relative to `templates/`)
    pub fn with_template(mut self, name: &str, data: impl Into<String>) -> Self {
        self.templates
            .push(ChartFile::new(format!("{}/{}", TEMPLATES_DIR, name), data));
        self
    }

    /// Add a CRD file (`name` is relative to `crds/`)
    pub fn with_crd(mut self, name: &str, data: impl Into<String>) -> Self {
        self.crds
            .push(ChartFile::new(format!("{}/{}", CRDS_DIR, name), data));
        self
    }

    /// Set default values
    pub fn with_values(mut self, values: Values) -> Self {
        self.values = values;
        self
    }

    /// Attach a sub-chart
    pub fn with_dependency(mut self, mut dependency: Chart) -> Self {
        dependency.set_parent_path(self.full_path());
        self.dependencies.push(dependency);
        self
    }

    fn set_parent_path(&mut self, parent: String) {
        self.parent_path = Some(parent);
        let own = self.full_path();
        for dep in &mut self.dependencies {
            dep.set_parent_path(own.clone());
        }
    }

    /// Whether this chart is the entry chart (not a dependency)
    pub fn is_root(&self) -> bool {
        self.parent_path.is_none()
    }

    /// Full path of this chart within the render tree
    ///
    /// The entry chart is `<name>`, a sub-chart `<parent>/charts/<name>`.
    pub fn full_path(&self) -> String {
        match &self.parent_path {
            Some(parent) => format!("{}/{}/{}", parent, CHARTS_DIR, self.metadata.name),
            None => self.metadata.name.clone(),
        }
    }

    /// Path of the entry chart's notes file as produced by the renderer
    pub fn notes_path(&self) -> String {
        format!("{}/{}/NOTES.txt", self.full_path(), TEMPLATES_DIR)
    }

    /// All CRD files of this chart and its dependencies, parents first
    pub fn crd_objects(&self) -> Vec<CrdObject<'_>> {
        let path = self.full_path();
        let mut crds: Vec<CrdObject<'_>> = self
            .crds
            .iter()
            .map(|file| CrdObject {
                name: &file.name,
                filename: format!("{}/{}", path, file.name),
                file,
            })
            .collect();

        for dep in &self.dependencies {
            crds.extend(dep.crd_objects());
        }
        crds
    }
}

mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Version, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}
