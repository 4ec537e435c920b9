//! Manifest sorting and hook classification
//!
//! Rendered output arrives as an ordered `path -> text` map. Each file is
//! split into YAML documents; documents carrying a hook annotation become
//! [`Hook`]s, everything else becomes an ordinary [`Manifest`]. Ordinary
//! manifests are ordered by kind priority so that dependencies (namespaces,
//! service accounts, config) exist before the workloads that use them.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use rudder_core::{Hook, VersionSet};
use serde::Deserialize;
use tracing::{debug, info};

use crate::annotations::{self, HookEvents};
use crate::error::{KubeError, Result};

/// Kind priority used when creating resources
pub const INSTALL_ORDER: &[&str] = &[
    "PriorityClass",
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "SecretList",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleList",
    "ClusterRoleBinding",
    "ClusterRoleBindingList",
    "Role",
    "RoleList",
    "RoleBinding",
    "RoleBindingList",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "Service",
    "IngressClass",
    "Ingress",
    "APIService",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

const SOURCE_PREFIX: &str = "# Source: ";

/// Kind order for a release's resources: creation, or teardown (the reverse)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindOrder {
    #[default]
    Install,
    Uninstall,
}

impl KindOrder {
    /// Rank of a kind; `None` for kinds outside the table
    fn rank(&self, kind: &str) -> Option<usize> {
        let pos = INSTALL_ORDER.iter().position(|k| *k == kind)?;
        Some(match self {
            KindOrder::Install => pos,
            KindOrder::Uninstall => INSTALL_ORDER.len() - 1 - pos,
        })
    }
}

/// The parts of a document needed to classify and order it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleHead {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawHead {
    api_version: String,
    kind: String,
    metadata: Option<RawMetadata>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMetadata {
    name: Option<String>,
    annotations: Option<BTreeMap<String, serde_yaml::Value>>,
}

impl SimpleHead {
    /// Parse the head of a single YAML document
    pub fn parse(document: &str) -> std::result::Result<Self, serde_yaml::Error> {
        let raw: Option<RawHead> = serde_yaml::from_str(document)?;
        let raw = raw.unwrap_or_default();
        let metadata = raw.metadata.unwrap_or_default();

        // Annotation values are strings on the wire, but unquoted numbers and
        // booleans are common in templates
        let annotations = metadata
            .annotations
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k, v)))
            .collect();

        Ok(Self {
            api_version: raw.api_version,
            kind: raw.kind,
            name: metadata.name.unwrap_or_default(),
            annotations,
        })
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// An ordinary (non-hook) rendered resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Source template path
    pub name: String,
    /// Raw document text
    pub content: String,
    pub head: SimpleHead,
}

/// Result of sorting a render
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedManifests {
    /// Hooks, ascending weight then name
    pub hooks: Vec<Hook>,
    /// Ordinary manifests in kind order
    pub manifests: Vec<Manifest>,
}

impl SortedManifests {
    /// Ordinary manifests framed with `# Source:` comments
    pub fn manifest_text(&self) -> String {
        let mut out = String::new();
        for m in &self.manifests {
            out.push_str(&frame(&m.name, &m.content));
        }
        out
    }
}

/// Frame one document the way it is written to output
pub fn frame(path: &str, content: &str) -> String {
    format!("---\n{}{}\n{}\n", SOURCE_PREFIX, path, content)
}

/// Best-effort dump of every non-blank file, used when sorting fails
pub fn dump_files(files: &IndexMap<String, String>) -> String {
    files
        .iter()
        .filter(|(_, content)| !content.trim().is_empty())
        .map(|(path, content)| frame(path, content))
        .collect()
}

/// Partials (`_helpers.tpl`) never produce resources
pub fn is_partial(path: &str) -> bool {
    path.rsplit('/').next().is_some_and(|base| base.starts_with('_'))
}

/// Split a file into YAML documents, dropping blank and comment-only ones
pub fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim_end() == "---" {
            push_document(&mut documents, &current);
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_document(&mut documents, &current);

    documents
}

fn push_document(documents: &mut Vec<String>, raw: &str) {
    let has_content = raw.lines().any(|l| {
        let t = l.trim();
        !t.is_empty() && !t.starts_with('#')
    });
    if has_content {
        documents.push(raw.trim().to_string());
    }
}

/// Classify and order rendered files
///
/// `files` must already have notes removed. Documents whose `apiVersion` is
/// absent from a non-empty `api_versions` set are kept; the cluster is the
/// final judge.
pub fn sort_manifests(
    files: &IndexMap<String, String>,
    api_versions: &VersionSet,
    order: KindOrder,
) -> Result<SortedManifests> {
    let mut hooks: Vec<Hook> = Vec::new();
    let mut manifests: Vec<Manifest> = Vec::new();

    for (path, text) in files {
        if is_partial(path) || text.trim().is_empty() {
            continue;
        }

        for document in split_documents(text) {
            let head = SimpleHead::parse(&document).map_err(|e| KubeError::Render {
                message: format!("YAML parse error on {}: {}", path, e),
                partial_manifest: dump_files(files),
            })?;

            if !api_versions.is_empty()
                && !head.api_version.is_empty()
                && !api_versions.has(&head.api_version)
            {
                debug!(
                    path = %path,
                    api_version = %head.api_version,
                    "apiVersion not advertised by the cluster"
                );
            }

            match annotations::hook_annotation(&head.annotations) {
                None => manifests.push(Manifest {
                    name: path.clone(),
                    content: document,
                    head,
                }),
                Some(value) => match annotations::parse_hook_events(value) {
                    HookEvents::Events(events) => hooks.push(Hook {
                        name: head.name.clone(),
                        kind: head.kind.clone(),
                        path: path.clone(),
                        weight: annotations::parse_hook_weight(&head.annotations),
                        delete_policies: annotations::parse_delete_policies(&head.annotations),
                        events,
                        manifest: document,
                    }),
                    HookEvents::LegacyCrdInstall => {
                        debug!(path = %path, "skipping legacy crd-install hook");
                    }
                    HookEvents::Unknown(event) => {
                        info!(path = %path, event = %event, "skipping document with unknown hook event");
                    }
                },
            }
        }
    }

    sort_by_kind(&mut manifests, order);
    hooks.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.name.cmp(&b.name)));

    Ok(SortedManifests { hooks, manifests })
}

/// Stable sort by kind rank, unknown kinds last (alphabetically), then
/// source path, then resource name
pub fn sort_by_kind(manifests: &mut [Manifest], order: KindOrder) {
    manifests.sort_by(|a, b| {
        let ra = order.rank(&a.head.kind);
        let rb = order.rank(&b.head.kind);
        let by_kind = match (ra, rb) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.head.kind.cmp(&b.head.kind),
        };
        by_kind
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.head.name.cmp(&b.head.name))
    });
}

/// Split a stored release manifest back into documents
///
/// The `# Source:` comment of each document becomes the manifest name and
/// is dropped from the content.
pub fn parse_release_manifest(text: &str) -> Result<Vec<Manifest>> {
    split_documents(text)
        .into_iter()
        .map(|document| {
            let mut name = String::new();
            let content = document
                .lines()
                .filter(|line| match line.strip_prefix(SOURCE_PREFIX) {
                    Some(path) if name.is_empty() => {
                        name = path.trim().to_string();
                        false
                    }
                    _ => true,
                })
                .collect::<Vec<_>>()
                .join("\n");
            let head = SimpleHead::parse(&content).map_err(|e| {
                KubeError::InvalidManifest(format!("stored manifest {}: {}", name, e))
            })?;
            Ok(Manifest {
                name,
                content,
                head,
            })
        })
        .collect()
}

/// Manifest text for deleting `manifests` in the given order
pub fn join_documents(manifests: &[Manifest]) -> String {
    manifests
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n")
}
