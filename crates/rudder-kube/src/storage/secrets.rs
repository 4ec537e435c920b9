//! Kubernetes-native storage drivers
//!
//! Release records are stored one object per revision, named by the release
//! key. The body is JSON, compressed and base64 encoded, under the `release`
//! data key; the compression method is recorded in a label. A separate
//! object per name holds the revision high-water mark.
//!
//! [`ObjectDriver`] is generic over the object type; Secrets are the
//! default, ConfigMaps live in the sibling module.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use rudder_core::Release;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    COMPRESSION_LABEL, CompressionMethod, Driver, OWNER, ReleaseFilter, StorageConfig,
    decode_from_storage, encode_for_storage, record_labels, watermark_key,
};
use crate::error::{KubeError, Result};

/// Data key holding the encoded record
pub const RECORD_DATA_KEY: &str = "release";

/// Data key holding the watermark revision
pub const WATERMARK_DATA_KEY: &str = "revision";

/// Owner label of watermark objects, kept apart from release records
pub const WATERMARK_OWNER: &str = "rudder-watermark";

/// Label naming the release a watermark object belongs to
pub const WATERMARK_FOR_LABEL: &str = "rudder.io/watermark-for";

/// Secret type of release records
pub const SECRET_TYPE: &str = "rudder.io/release.v1";

/// A namespaced object type that can carry string data
pub trait RecordObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Driver name for logs
    const DRIVER: &'static str;

    /// Build an object holding `value` under `data_key`
    fn build(metadata: ObjectMeta, data_key: &str, value: &str) -> Self;

    /// String data under `data_key`
    fn value(&self, data_key: &str) -> Option<String>;
}

impl RecordObject for Secret {
    const DRIVER: &'static str = "secret";

    fn build(metadata: ObjectMeta, data_key: &str, value: &str) -> Self {
        let data = BTreeMap::from([(
            data_key.to_string(),
            k8s_openapi::ByteString(value.as_bytes().to_vec()),
        )]);
        Secret {
            metadata,
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    fn value(&self, data_key: &str) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get(data_key))
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
    }
}

/// Build the object storing one release revision
pub fn record_object<K: RecordObject>(
    key: &str,
    namespace: &str,
    release: &Release,
    compression: CompressionMethod,
) -> Result<K> {
    let mut labels = record_labels(release);
    labels.insert(COMPRESSION_LABEL.to_string(), compression.label().to_string());

    let metadata = ObjectMeta {
        name: Some(key.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    };
    Ok(K::build(
        metadata,
        RECORD_DATA_KEY,
        &encode_for_storage(release, compression)?,
    ))
}

/// Decode the release stored in an object
pub fn release_from_object<K: RecordObject>(
    object: &K,
    fallback: CompressionMethod,
) -> Result<Release> {
    let payload = object.value(RECORD_DATA_KEY).ok_or_else(|| {
        KubeError::Storage(format!(
            "{} '{}' has no '{}' data",
            K::DRIVER,
            object.name_any(),
            RECORD_DATA_KEY
        ))
    })?;
    let compression = CompressionMethod::from_label(
        object.labels().get(COMPRESSION_LABEL).map(String::as_str),
        fallback,
    );
    decode_from_storage(&payload, compression)
}

fn watermark_object<K: RecordObject>(name: &str, namespace: &str, revision: u32) -> K {
    let labels = BTreeMap::from([
        ("owner".to_string(), WATERMARK_OWNER.to_string()),
        (WATERMARK_FOR_LABEL.to_string(), name.to_string()),
    ]);
    let metadata = ObjectMeta {
        name: Some(watermark_key(name)),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    };
    K::build(metadata, WATERMARK_DATA_KEY, &revision.to_string())
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == code)
}

/// Storage driver over a namespaced Kubernetes object type
pub struct ObjectDriver<K> {
    client: Client,
    /// Empty means every namespace for reads
    namespace: String,
    compression: CompressionMethod,
    _kind: PhantomData<fn() -> K>,
}

/// Release records in Secrets
pub type SecretsDriver = ObjectDriver<Secret>;

impl<K: RecordObject> ObjectDriver<K> {
    pub fn new(client: Client, namespace: impl Into<String>, config: &StorageConfig) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            compression: config.compression,
            _kind: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// API for writes and point reads
    fn api(&self) -> Api<K> {
        if self.namespace.is_empty() {
            Api::default_namespaced(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }

    /// API for listing; spans all namespaces when none is set
    fn list_api(&self) -> Api<K> {
        if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }

    fn write_namespace(&self) -> String {
        if self.namespace.is_empty() {
            self.client.default_namespace().to_string()
        } else {
            self.namespace.clone()
        }
    }

    async fn list_records(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Release>> {
        let lp = ListParams::default().labels(&label_selector(selector));
        let objects = self.list_api().list(&lp).await?;

        let mut releases = Vec::with_capacity(objects.items.len());
        for object in &objects.items {
            match release_from_object(object, self.compression) {
                Ok(release) => releases.push(release),
                Err(e) => warn!(
                    driver = K::DRIVER,
                    object = %object.name_any(),
                    "skipping undecodable release record: {}",
                    e
                ),
            }
        }
        Ok(releases)
    }
}

#[async_trait]
impl<K: RecordObject> Driver for ObjectDriver<K> {
    fn name(&self) -> &'static str {
        K::DRIVER
    }

    async fn get(&self, key: &str) -> Result<Release> {
        match self.api().get(key).await {
            Ok(object) => release_from_object(&object, self.compression),
            Err(e) if is_status(&e, 404) => Err(KubeError::RecordNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>> {
        let mut selector = labels.clone();
        selector
            .entry("owner".to_string())
            .or_insert_with(|| OWNER.to_string());
        self.list_records(&selector).await
    }

    async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>> {
        let selector = BTreeMap::from([("owner".to_string(), OWNER.to_string())]);
        let mut releases = self.list_records(&selector).await?;
        releases.retain(|r| filter(r));
        Ok(releases)
    }

    async fn create(&self, key: &str, release: &Release) -> Result<()> {
        let object: K = record_object(key, &self.write_namespace(), release, self.compression)?;
        match self.api().create(&PostParams::default(), &object).await {
            Ok(_) => {
                debug!(driver = K::DRIVER, key, "stored release record");
                Ok(())
            }
            Err(e) if is_status(&e, 409) => Err(KubeError::ReleaseAlreadyExists {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, key: &str, release: &Release) -> Result<()> {
        let object: K = record_object(key, &self.write_namespace(), release, self.compression)?;
        match self.api().replace(key, &PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(KubeError::RecordNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        let release = self.get(key).await?;
        match self.api().delete(key, &DeleteParams::default()).await {
            Ok(_) => Ok(release),
            Err(e) if is_status(&e, 404) => Err(KubeError::RecordNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn revision_watermark(&self, name: &str) -> Result<u32> {
        match self.api().get(&watermark_key(name)).await {
            Ok(object) => object
                .value(WATERMARK_DATA_KEY)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| {
                    KubeError::Storage(format!("watermark for '{}' is unreadable", name))
                }),
            Err(e) if is_status(&e, 404) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn raise_watermark(&self, name: &str, revision: u32) -> Result<()> {
        let api = self.api();
        let key = watermark_key(name);
        let object: K = watermark_object(name, &self.write_namespace(), revision);

        match api.get(&key).await {
            Ok(existing) => {
                let current = existing
                    .value(WATERMARK_DATA_KEY)
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .unwrap_or(0);
                if current >= revision {
                    return Ok(());
                }
                api.replace(&key, &PostParams::default(), &object).await?;
            }
            Err(e) if is_status(&e, 404) => {
                api.create(&PostParams::default(), &object).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::release_key;
    use crate::storage::tests::release;
    use rudder_core::ReleaseStatus;

    #[test]
    fn test_secret_record_roundtrip() {
        let rel = release("myapp", 2, ReleaseStatus::Deployed);
        let secret: Secret = record_object(
            &release_key("myapp", 2),
            "prod",
            &rel,
            CompressionMethod::Gzip { level: 6 },
        )
        .unwrap();

        assert_eq!(secret.name_any(), "sh.rudder.release.v1.myapp.v2");
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE));
        let labels = secret.labels();
        assert_eq!(labels["owner"], "rudder");
        assert_eq!(labels["status"], "deployed");
        assert_eq!(labels[COMPRESSION_LABEL], "gzip");

        // The label wins over the driver's configured method
        let back = release_from_object(&secret, CompressionMethod::None).unwrap();
        assert_eq!(back, rel);
    }

    #[test]
    fn test_missing_payload() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("broken".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = release_from_object(&secret, CompressionMethod::None).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_watermark_object() {
        let secret: Secret = watermark_object("myapp", "prod", 7);
        assert_eq!(secret.name_any(), "sh.rudder.release.v1.myapp.watermark");
        assert_eq!(secret.value(WATERMARK_DATA_KEY).as_deref(), Some("7"));
        assert_eq!(secret.labels()["owner"], WATERMARK_OWNER);
        assert!(!secret.labels().contains_key("name"));
    }

    #[test]
    fn test_label_selector() {
        let labels = BTreeMap::from([
            ("name".to_string(), "myapp".to_string()),
            ("owner".to_string(), "rudder".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "name=myapp,owner=rudder");
    }
}
