//! In-memory storage driver
//!
//! Records live in a process-local map shared by every clone of the
//! driver, scoped by namespace. Changing the namespace with
//! [`MemoryDriver::set_namespace`] keeps the stored contents.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rudder_core::Release;
use tokio::sync::RwLock;

use super::{Driver, ReleaseFilter, matches_labels};
use crate::error::{KubeError, Result};

/// namespace -> key -> record
type Records = HashMap<String, BTreeMap<String, Release>>;

/// Counts of operations performed, for test assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub queries: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

#[derive(Debug, Default)]
struct Shared {
    records: Records,
    /// namespace -> name -> highest revision
    watermarks: HashMap<String, HashMap<String, u32>>,
    operations: OperationCounts,
}

/// In-memory storage driver
#[derive(Clone, Default)]
pub struct MemoryDriver {
    /// Empty means every namespace for reads
    namespace: String,
    shared: Arc<RwLock<Shared>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Switch the active namespace, keeping all stored records
    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    pub async fn operation_counts(&self) -> OperationCounts {
        self.shared.read().await.operations.clone()
    }

    /// Total number of records across namespaces
    pub async fn release_count(&self) -> usize {
        self.shared
            .read()
            .await
            .records
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    /// Namespace holding `key`; with no namespace set, every namespace is
    /// searched and the first in name order wins
    fn owner_of(&self, records: &Records, key: &str) -> Option<String> {
        records
            .iter()
            .filter(|(ns, _)| self.namespace.is_empty() || **ns == self.namespace)
            .filter(|(_, by_key)| by_key.contains_key(key))
            .map(|(ns, _)| ns.clone())
            .min()
    }

    fn visible<'a>(&'a self, records: &'a Records) -> impl Iterator<Item = &'a Release> + 'a {
        records
            .iter()
            .filter(move |(ns, _)| self.namespace.is_empty() || **ns == self.namespace)
            .flat_map(|(_, by_key)| by_key.values())
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Release> {
        let mut shared = self.shared.write().await;
        shared.operations.gets += 1;
        self.owner_of(&shared.records, key)
            .and_then(|ns| shared.records.get(&ns))
            .and_then(|by_key| by_key.get(key))
            .cloned()
            .ok_or_else(|| KubeError::RecordNotFound {
                key: key.to_string(),
            })
    }

    async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>> {
        let mut shared = self.shared.write().await;
        shared.operations.queries += 1;
        Ok(self
            .visible(&shared.records)
            .filter(|r| matches_labels(r, labels))
            .cloned()
            .collect())
    }

    async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>> {
        let shared = self.shared.read().await;
        Ok(self
            .visible(&shared.records)
            .filter(|r| filter(r))
            .cloned()
            .collect())
    }

    async fn create(&self, key: &str, release: &Release) -> Result<()> {
        let mut shared = self.shared.write().await;
        shared.operations.creates += 1;
        let by_key = shared.records.entry(self.namespace.clone()).or_default();
        if by_key.contains_key(key) {
            return Err(KubeError::ReleaseAlreadyExists {
                key: key.to_string(),
            });
        }
        by_key.insert(key.to_string(), release.clone());
        Ok(())
    }

    async fn update(&self, key: &str, release: &Release) -> Result<()> {
        let mut shared = self.shared.write().await;
        shared.operations.updates += 1;
        let owner = self.owner_of(&shared.records, key);
        match owner
            .and_then(|ns| shared.records.get_mut(&ns))
            .and_then(|by_key| by_key.get_mut(key))
        {
            Some(existing) => {
                *existing = release.clone();
                Ok(())
            }
            None => Err(KubeError::RecordNotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        let mut shared = self.shared.write().await;
        shared.operations.deletes += 1;
        let owner = self.owner_of(&shared.records, key);
        owner
            .and_then(|ns| shared.records.get_mut(&ns))
            .and_then(|by_key| by_key.remove(key))
            .ok_or_else(|| KubeError::RecordNotFound {
                key: key.to_string(),
            })
    }

    async fn revision_watermark(&self, name: &str) -> Result<u32> {
        let shared = self.shared.read().await;
        Ok(shared
            .watermarks
            .iter()
            .filter(|(ns, _)| self.namespace.is_empty() || **ns == self.namespace)
            .filter_map(|(_, by_name)| by_name.get(name).copied())
            .max()
            .unwrap_or(0))
    }

    async fn raise_watermark(&self, name: &str, revision: u32) -> Result<()> {
        let mut shared = self.shared.write().await;
        let mark = shared
            .watermarks
            .entry(self.namespace.clone())
            .or_default()
            .entry(name.to_string())
            .or_insert(0);
        *mark = (*mark).max(revision);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::release_key;
    use crate::storage::tests::release;
    use rudder_core::ReleaseStatus;

    #[tokio::test]
    async fn test_crud() {
        let driver = MemoryDriver::new();
        let rel = release("myapp", 1, ReleaseStatus::Deployed);
        let key = release_key("myapp", 1);

        driver.create(&key, &rel).await.unwrap();
        assert!(matches!(
            driver.create(&key, &rel).await,
            Err(KubeError::ReleaseAlreadyExists { .. })
        ));
        assert_eq!(driver.get(&key).await.unwrap(), rel);

        let mut updated = rel.clone();
        updated.mark_superseded();
        driver.update(&key, &updated).await.unwrap();
        assert_eq!(
            driver.get(&key).await.unwrap().status,
            ReleaseStatus::Superseded
        );

        driver.delete(&key).await.unwrap();
        assert!(driver.get(&key).await.unwrap_err().is_not_found());
        assert!(driver.update(&key, &rel).await.unwrap_err().is_not_found());

        let counts = driver.operation_counts().await;
        assert_eq!(counts.creates, 2);
        assert_eq!(counts.deletes, 1);
    }

    #[tokio::test]
    async fn test_namespace_switch_keeps_contents() {
        let mut driver = MemoryDriver::new();
        driver.set_namespace("team-a");
        driver
            .create(&release_key("a", 1), &release("a", 1, ReleaseStatus::Deployed))
            .await
            .unwrap();

        let clone = driver.clone();
        driver.set_namespace("team-b");
        assert!(driver.get(&release_key("a", 1)).await.is_err());

        driver.set_namespace("team-a");
        assert!(driver.get(&release_key("a", 1)).await.is_ok());
        assert_eq!(clone.release_count().await, 1);
    }

    #[tokio::test]
    async fn test_query_by_labels_across_namespaces() {
        let mut driver = MemoryDriver::new();
        driver.set_namespace("one");
        driver
            .create(&release_key("a", 1), &release("a", 1, ReleaseStatus::Deployed))
            .await
            .unwrap();
        driver.set_namespace("two");
        driver
            .create(&release_key("a", 1), &release("a", 1, ReleaseStatus::Failed))
            .await
            .unwrap();

        let selector = BTreeMap::from([("status".to_string(), "failed".to_string())]);
        assert_eq!(driver.query(&selector).await.unwrap().len(), 1);

        driver.set_namespace("");
        let selector = BTreeMap::from([("name".to_string(), "a".to_string())]);
        assert_eq!(driver.query(&selector).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_keyed_access_across_namespaces() {
        let mut driver = MemoryDriver::new();
        driver.set_namespace("team-a");
        let key = release_key("a", 1);
        driver
            .create(&key, &release("a", 1, ReleaseStatus::Deployed))
            .await
            .unwrap();
        driver.raise_watermark("a", 1).await.unwrap();

        driver.set_namespace("");
        assert_eq!(driver.get(&key).await.unwrap().version, 1);
        assert_eq!(driver.revision_watermark("a").await.unwrap(), 1);

        let mut superseded = release("a", 1, ReleaseStatus::Superseded);
        superseded.namespace = "team-a".to_string();
        driver.update(&key, &superseded).await.unwrap();

        driver.set_namespace("team-a");
        assert_eq!(
            driver.get(&key).await.unwrap().status,
            ReleaseStatus::Superseded
        );

        driver.set_namespace("");
        driver.delete(&key).await.unwrap();
        assert_eq!(driver.release_count().await, 0);
        assert!(driver.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watermark_never_lowers() {
        let driver = MemoryDriver::new();
        assert_eq!(driver.revision_watermark("a").await.unwrap(), 0);
        driver.raise_watermark("a", 4).await.unwrap();
        driver.raise_watermark("a", 2).await.unwrap();
        assert_eq!(driver.revision_watermark("a").await.unwrap(), 4);
    }
}
