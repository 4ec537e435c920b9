//! Applying and deleting manifests on the cluster
//!
//! [`ResourceClient`] is the seam the actions talk to. [`KubeResources`]
//! implements it with Server-Side Apply over dynamic objects, resolving each
//! document's kind through API discovery. Documents are processed in the
//! order given; callers sort them first.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PropagationPolicy},
    core::{GroupVersionKind, TypeMeta},
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
    runtime::wait::{await_condition, conditions},
};
use tracing::{debug, info};

use crate::annotations;
use crate::error::{KubeError, Result};
use crate::manifest::split_documents;

/// Field manager name for Server-Side Apply
pub const FIELD_MANAGER: &str = "rudder";

/// Summary of apply/delete operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationSummary {
    /// Successfully processed resources
    pub succeeded: Vec<String>,
    /// Failed resources with errors
    pub failed: Vec<(String, String)>,
    /// Skipped resources (e.g., due to policy)
    pub skipped: Vec<(String, String)>,
}

impl OperationSummary {
    /// Check if all operations succeeded
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// Human-readable counts
    pub fn summary(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if !self.succeeded.is_empty() {
            parts.push(format!("{} succeeded", self.succeeded.len()));
        }
        if !self.failed.is_empty() {
            parts.push(format!("{} failed", self.failed.len()));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }
        if parts.is_empty() {
            "No resources processed".to_string()
        } else {
            parts.join(", ")
        }
    }

    /// Turn failures into an error naming every failed resource
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let failures = self
            .failed
            .iter()
            .map(|(name, err)| format!("{}: {}", name, err))
            .collect::<Vec<_>>()
            .join("; ");
        Err(KubeError::InvalidManifest(failures))
    }
}

/// Cluster mutations needed by release actions
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create or update every document of `manifest`, in order
    async fn apply(&self, namespace: &str, manifest: &str) -> Result<OperationSummary>;

    /// Delete every document of `manifest`, in order. Missing objects and
    /// objects annotated with the keep policy are skipped.
    async fn delete(&self, namespace: &str, manifest: &str) -> Result<OperationSummary>;

    /// Block until a hook resource has finished. Jobs are awaited until
    /// complete; every other kind is ready once applied.
    async fn wait_for_hook(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;
}

/// Parsed resource ready for Kubernetes operations
#[derive(Debug, Clone)]
struct ParsedResource {
    obj: DynamicObject,
    gvk: GroupVersionKind,
    api_resource: ApiResource,
    capabilities: ApiCapabilities,
}

impl ParsedResource {
    fn display_name(&self) -> String {
        let name = self.obj.metadata.name.as_deref().unwrap_or("unnamed");
        match &self.obj.metadata.namespace {
            Some(ns) => format!("{}/{}/{}", ns, self.gvk.kind, name),
            None => format!("{}/{}", self.gvk.kind, name),
        }
    }

    fn has_keep_policy(&self) -> bool {
        self.obj
            .metadata
            .annotations
            .as_ref()
            .is_some_and(annotations::should_keep_resource)
    }

    fn name(&self) -> Result<&str> {
        self.obj.metadata.name.as_deref().ok_or_else(|| {
            KubeError::InvalidManifest(format!("{} is missing metadata.name", self.gvk.kind))
        })
    }
}

/// [`ResourceClient`] over a live cluster
pub struct KubeResources {
    client: Client,
    discovery: Discovery,
}

impl KubeResources {
    /// Run API discovery and build the client
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self { client, discovery })
    }

    fn parse_manifest(&self, manifest: &str, default_namespace: &str) -> Result<Vec<ParsedResource>> {
        split_documents(manifest)
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                self.parse_document(doc, default_namespace).map_err(|e| {
                    KubeError::InvalidManifest(format!("failed to parse document {}: {}", index, e))
                })
            })
            .collect()
    }

    fn parse_document(&self, doc: &str, default_namespace: &str) -> Result<ParsedResource> {
        let mut obj: DynamicObject = serde_yaml::from_str(doc)?;

        let type_meta = obj
            .types
            .as_ref()
            .ok_or_else(|| KubeError::InvalidManifest("missing apiVersion or kind".to_string()))?;
        let gvk = gvk_from_type_meta(type_meta);

        let (api_resource, capabilities) = self.discovery.resolve_gvk(&gvk).ok_or_else(|| {
            KubeError::InvalidManifest(format!(
                "unknown resource type: {}/{}",
                type_meta.api_version, type_meta.kind
            ))
        })?;

        if capabilities.scope == Scope::Namespaced && obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some(default_namespace.to_string());
        }

        Ok(ParsedResource {
            obj,
            gvk,
            api_resource,
            capabilities,
        })
    }

    fn api_for_resource(&self, resource: &ParsedResource) -> Api<DynamicObject> {
        if resource.capabilities.scope == Scope::Namespaced {
            let ns = resource.obj.metadata.namespace.as_deref().unwrap_or("default");
            Api::namespaced_with(self.client.clone(), ns, &resource.api_resource)
        } else {
            Api::all_with(self.client.clone(), &resource.api_resource)
        }
    }

    /// Server-Side Apply; returns whether the object was created
    async fn apply_resource(&self, resource: &ParsedResource) -> Result<bool> {
        let name = resource.name()?;
        let api = self.api_for_resource(resource);

        let exists = api.get_opt(name).await?.is_some();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&resource.obj)).await?;

        Ok(!exists)
    }

    /// Background-propagated delete; returns false when already gone
    async fn delete_resource(&self, resource: &ParsedResource) -> Result<bool> {
        let name = resource.name()?;
        let api = self.api_for_resource(resource);

        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        match api.delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResources {
    async fn apply(&self, namespace: &str, manifest: &str) -> Result<OperationSummary> {
        let resources = self.parse_manifest(manifest, namespace)?;
        let mut summary = OperationSummary::default();

        for resource in &resources {
            let name = resource.display_name();
            match self.apply_resource(resource).await {
                Ok(created) => {
                    let action = if created { "created" } else { "configured" };
                    debug!("{} {}", name, action);
                    summary.succeeded.push(format!("{} ({})", name, action));
                }
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }

        info!("apply: {}", summary.summary());
        Ok(summary)
    }

    async fn delete(&self, namespace: &str, manifest: &str) -> Result<OperationSummary> {
        let resources = self.parse_manifest(manifest, namespace)?;
        let mut summary = OperationSummary::default();

        for resource in &resources {
            let name = resource.display_name();
            if resource.has_keep_policy() {
                summary
                    .skipped
                    .push((name, "resource-policy: keep".to_string()));
                continue;
            }

            match self.delete_resource(resource).await {
                Ok(true) => summary.succeeded.push(format!("{} (deleted)", name)),
                Ok(false) => summary.skipped.push((name, "not found".to_string())),
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }

        info!("delete: {}", summary.summary());
        Ok(summary)
    }

    async fn wait_for_hook(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        if kind != "Job" {
            return Ok(());
        }

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let condition = await_condition(jobs, name, conditions::is_job_completed());

        match tokio::time::timeout(timeout, condition).await {
            Ok(Ok(Some(job))) => {
                let status = job.status.unwrap_or_default();
                if status.succeeded.unwrap_or(0) > 0 {
                    Ok(())
                } else {
                    Err(KubeError::InvalidManifest(format!(
                        "job {} failed with {} failures",
                        name,
                        status.failed.unwrap_or(0)
                    )))
                }
            }
            Ok(Ok(None)) => Err(KubeError::InvalidManifest(format!(
                "job {} was deleted before completion",
                name
            ))),
            Ok(Err(e)) => Err(KubeError::InvalidManifest(format!(
                "waiting for job {} failed: {}",
                name, e
            ))),
            Err(_) => Err(KubeError::InvalidManifest(format!(
                "job {} timed out after {:?}",
                name, timeout
            ))),
        }
    }
}

/// "apps/v1" -> ("apps", "v1"); "v1" -> ("", "v1")
fn gvk_from_type_meta(tm: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match tm.api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), tm.api_version.clone()),
    };

    GroupVersionKind {
        group,
        version,
        kind: tm.kind.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvk_from_type_meta() {
        let gvk = gvk_from_type_meta(&TypeMeta {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
        });
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");

        let gvk = gvk_from_type_meta(&TypeMeta {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
        });
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Service");
    }

    #[test]
    fn test_operation_summary() {
        let mut summary = OperationSummary::default();
        assert_eq!(summary.summary(), "No resources processed");

        summary.succeeded.push("default/Service/web (created)".to_string());
        summary
            .skipped
            .push(("default/ConfigMap/keep".to_string(), "resource-policy: keep".to_string()));
        assert_eq!(summary.summary(), "1 succeeded, 1 skipped");
        assert_eq!(summary.total(), 2);
        assert!(summary.clone().into_result().is_ok());

        summary
            .failed
            .push(("default/Job/migrate".to_string(), "forbidden".to_string()));
        let err = summary.into_result().unwrap_err();
        assert!(err.to_string().contains("default/Job/migrate: forbidden"));
    }
}
