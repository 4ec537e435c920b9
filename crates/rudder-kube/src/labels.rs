//! Release label stamping
//!
//! Injects a tracking label into selected resource kinds. Workload
//! controllers get the label on their own metadata, their selector, and their
//! pod template so that the selector keeps matching the pods it creates.

use serde_yaml::{Mapping, Value};

use crate::error::Result;
use crate::manifest::split_documents;

/// Label key used when the caller does not choose one
pub const DEFAULT_RELEASE_LABEL: &str = "rudder.io/release";

const METADATA_LABELS: &[&str] = &["metadata", "labels"];
const SELECTOR_LABELS: &[&str] = &["spec", "selector", "matchLabels"];
const TEMPLATE_LABELS: &[&str] = &["spec", "template", "metadata", "labels"];

/// A label to stamp onto rendered resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseLabel {
    pub key: String,
    pub value: String,
}

impl ReleaseLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `rudder.io/release=<release name>`
    pub fn for_release(release_name: impl Into<String>) -> Self {
        Self::new(DEFAULT_RELEASE_LABEL, release_name)
    }
}

/// Paths stamped for an `apiVersion`/`kind` pair, empty when untouched
fn label_paths(api_version: &str, kind: &str) -> &'static [&'static [&'static str]] {
    match (api_version, kind) {
        ("apps/v1", "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet") => {
            &[METADATA_LABELS, SELECTOR_LABELS, TEMPLATE_LABELS]
        }
        (
            "v1",
            "Pod" | "Service" | "PersistentVolumeClaim" | "PersistentVolume" | "ConfigMap"
            | "Secret" | "ServiceAccount",
        )
        | ("batch/v1", "Job" | "CronJob")
        | ("networking.k8s.io/v1", "Ingress" | "NetworkPolicy") => &[METADATA_LABELS],
        _ => &[],
    }
}

/// Set `key=value` under `path`, creating absent or null containers.
/// Existing non-mapping values on the path are left alone.
fn upsert_path(node: &mut Value, path: &[&str], key: &str, value: &str) {
    if node.is_null() {
        *node = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = node else {
        return;
    };

    match path.split_first() {
        None => {
            map.insert(Value::from(key), Value::from(value));
        }
        Some((segment, rest)) => {
            let child = map.entry(Value::from(*segment)).or_insert(Value::Null);
            upsert_path(child, rest, key, value);
        }
    }
}

/// Stamp one YAML document. Documents of other kinds, and documents whose
/// root is not a mapping, are returned unchanged.
pub fn stamp_document(document: &str, label: &ReleaseLabel) -> Result<String> {
    let mut root: Value = serde_yaml::from_str(document)?;
    if !root.is_mapping() {
        return Ok(document.to_string());
    }

    let api_version = root.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
    let kind = root.get("kind").and_then(Value::as_str).unwrap_or_default();
    let paths = label_paths(api_version, kind);
    if paths.is_empty() {
        return Ok(document.to_string());
    }

    for path in paths {
        upsert_path(&mut root, path, &label.key, &label.value);
    }

    Ok(serde_yaml::to_string(&root)?.trim_end().to_string())
}

/// Stamp every document of a multi-document text, keeping document boundaries
pub fn stamp_documents(text: &str, label: &ReleaseLabel) -> Result<String> {
    let stamped = split_documents(text)
        .iter()
        .map(|doc| stamp_document(doc, label))
        .collect::<Result<Vec<_>>>()?;
    Ok(stamped.join("\n---\n"))
}
