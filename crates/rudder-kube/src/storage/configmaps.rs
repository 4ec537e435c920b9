//! ConfigMap storage driver
//!
//! Same record layout as the Secrets driver; readable by anyone who can
//! read ConfigMaps in the namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::secrets::{ObjectDriver, RecordObject};

/// Release records in ConfigMaps
pub type ConfigMapsDriver = ObjectDriver<ConfigMap>;

impl RecordObject for ConfigMap {
    const DRIVER: &'static str = "configmap";

    fn build(metadata: ObjectMeta, data_key: &str, value: &str) -> Self {
        ConfigMap {
            metadata,
            data: Some(BTreeMap::from([(data_key.to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn value(&self, data_key: &str) -> Option<String> {
        self.data.as_ref().and_then(|d| d.get(data_key)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::secrets::{RECORD_DATA_KEY, record_object, release_from_object};
    use crate::storage::tests::release;
    use crate::storage::{CompressionMethod, release_key};
    use kube::ResourceExt;
    use rudder_core::ReleaseStatus;

    #[test]
    fn test_configmap_record_roundtrip() {
        let rel = release("myapp", 1, ReleaseStatus::PendingInstall);
        let cm: ConfigMap = record_object(
            &release_key("myapp", 1),
            "default",
            &rel,
            CompressionMethod::Zstd { level: 3 },
        )
        .unwrap();

        assert_eq!(cm.labels()["status"], "pending-install");
        assert!(cm.value(RECORD_DATA_KEY).is_some());
        assert_eq!(
            release_from_object(&cm, CompressionMethod::None).unwrap(),
            rel
        );
    }
}
