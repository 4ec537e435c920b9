//! SQL storage driver (SQLite)
//!
//! Records are stored as JSON bodies with their indexed columns (name,
//! version, status, owner) alongside. Custom labels live in the body and
//! are matched after loading.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use rudder_core::Release;
use tracing::debug;

use super::{Driver, OWNER, ReleaseFilter, matches_labels};
use crate::error::{KubeError, Result};

/// Environment variable holding the SQLite path (or `:memory:`)
pub const SQL_CONNECTION_STRING_ENV: &str = "RUDDER_DRIVER_SQL_CONNECTION_STRING";

const IN_MEMORY: &str = ":memory:";

/// SQLite-backed release storage
pub struct SqlDriver {
    conn: Mutex<Connection>,
    /// Empty means every namespace for reads
    namespace: String,
}

impl SqlDriver {
    /// Open a database from a connection string: a file path, optionally
    /// prefixed with `sqlite://`, or `:memory:`
    pub fn open(connection_string: &str, namespace: impl Into<String>) -> Result<Self> {
        let target = connection_string
            .trim()
            .trim_start_matches("sqlite://");

        let conn = if target.is_empty() || target == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            let path = Path::new(target);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        };

        let driver = Self {
            conn: Mutex::new(conn),
            namespace: namespace.into(),
        };
        driver.init()?;
        Ok(driver)
    }

    /// Open the database named by `RUDDER_DRIVER_SQL_CONNECTION_STRING`;
    /// an in-memory database when unset
    pub fn from_env(namespace: impl Into<String>) -> Result<Self> {
        let connection_string = std::env::var(SQL_CONNECTION_STRING_ENV).unwrap_or_else(|_| {
            debug!("{} not set, using an in-memory database", SQL_CONNECTION_STRING_ENV);
            IN_MEMORY.to_string()
        });
        Self::open(&connection_string, namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| KubeError::Storage("SQL connection lock poisoned".to_string()))
    }

    fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS releases (
                key TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                owner TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (key, namespace)
            );

            CREATE INDEX IF NOT EXISTS idx_releases_name ON releases(namespace, name);

            CREATE TABLE IF NOT EXISTS release_watermarks (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                revision INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            "#,
        )?;
        Ok(())
    }

    /// Bodies in scope, optionally narrowed to one release name
    fn load(&self, name: Option<&str>) -> Result<Vec<Release>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM releases
             WHERE (?1 = '' OR namespace = ?1) AND (?2 IS NULL OR name = ?2) AND owner = ?3
             ORDER BY namespace, name, version",
        )?;
        let bodies = stmt
            .query_map(params![self.namespace, name, OWNER], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str::<Release>(body).map_err(KubeError::from))
            .collect()
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

#[async_trait]
impl Driver for SqlDriver {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn get(&self, key: &str) -> Result<Release> {
        let body: Option<String> = self
            .conn()?
            .query_row(
                "SELECT body FROM releases WHERE key = ?1 AND namespace = ?2",
                params![key, self.namespace],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(KubeError::RecordNotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>> {
        let releases = self.load(labels.get("name").map(String::as_str))?;
        Ok(releases
            .into_iter()
            .filter(|r| matches_labels(r, labels))
            .collect())
    }

    async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>> {
        let mut releases = self.load(None)?;
        releases.retain(|r| filter(r));
        Ok(releases)
    }

    async fn create(&self, key: &str, release: &Release) -> Result<()> {
        let body = serde_json::to_string(release)?;
        let now = Utc::now().timestamp();
        let result = self.conn()?.execute(
            "INSERT INTO releases (key, namespace, name, version, status, owner, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key,
                self.namespace,
                release.name,
                release.version,
                release.status.as_str(),
                OWNER,
                body,
                now
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(KubeError::ReleaseAlreadyExists {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, key: &str, release: &Release) -> Result<()> {
        let body = serde_json::to_string(release)?;
        let changed = self.conn()?.execute(
            "UPDATE releases SET name = ?3, version = ?4, status = ?5, body = ?6, modified_at = ?7
             WHERE key = ?1 AND namespace = ?2",
            params![
                key,
                self.namespace,
                release.name,
                release.version,
                release.status.as_str(),
                body,
                Utc::now().timestamp()
            ],
        )?;

        if changed == 0 {
            return Err(KubeError::RecordNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        let release = self.get(key).await?;
        self.conn()?.execute(
            "DELETE FROM releases WHERE key = ?1 AND namespace = ?2",
            params![key, self.namespace],
        )?;
        Ok(release)
    }

    async fn revision_watermark(&self, name: &str) -> Result<u32> {
        let revision: Option<u32> = self
            .conn()?
            .query_row(
                "SELECT revision FROM release_watermarks WHERE namespace = ?1 AND name = ?2",
                params![self.namespace, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(revision.unwrap_or(0))
    }

    async fn raise_watermark(&self, name: &str, revision: u32) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO release_watermarks (namespace, name, revision) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, name) DO UPDATE SET revision = MAX(revision, excluded.revision)",
            params![self.namespace, name, revision],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::release;
    use crate::storage::{Backend, Storage, release_key};
    use rudder_core::ReleaseStatus;

    fn driver() -> SqlDriver {
        SqlDriver::open(":memory:", "default").unwrap()
    }

    #[tokio::test]
    async fn test_crud() {
        let driver = driver();
        let rel = release("myapp", 1, ReleaseStatus::PendingInstall);
        let key = release_key("myapp", 1);

        driver.create(&key, &rel).await.unwrap();
        assert!(matches!(
            driver.create(&key, &rel).await,
            Err(KubeError::ReleaseAlreadyExists { .. })
        ));

        let mut deployed = rel.clone();
        deployed.mark_deployed("Install complete");
        driver.update(&key, &deployed).await.unwrap();
        assert_eq!(driver.get(&key).await.unwrap(), deployed);

        assert_eq!(driver.delete(&key).await.unwrap(), deployed);
        assert!(driver.get(&key).await.unwrap_err().is_not_found());
        assert!(
            driver
                .update(&key, &deployed)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_query_custom_labels() {
        let driver = driver();
        let mut a = release("a", 1, ReleaseStatus::Deployed);
        a.labels.insert("team".to_string(), "core".to_string());
        let b = release("b", 1, ReleaseStatus::Deployed);
        driver.create(&release_key("a", 1), &a).await.unwrap();
        driver.create(&release_key("b", 1), &b).await.unwrap();

        let selector = BTreeMap::from([("team".to_string(), "core".to_string())]);
        let found = driver.query(&selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a");

        let selector = BTreeMap::from([("name".to_string(), "b".to_string())]);
        assert_eq!(driver.query(&selector).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("releases.db");
        let path = path.to_string_lossy();

        let one = SqlDriver::open(&path, "one").unwrap();
        one.create(&release_key("a", 1), &release("a", 1, ReleaseStatus::Deployed))
            .await
            .unwrap();

        let two = SqlDriver::open(&path, "two").unwrap();
        assert!(two.get(&release_key("a", 1)).await.is_err());

        let all = SqlDriver::open(&format!("sqlite://{}", path), "").unwrap();
        assert_eq!(all.list(&|_: &Release| true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watermark() {
        let driver = driver();
        assert_eq!(driver.revision_watermark("a").await.unwrap(), 0);
        driver.raise_watermark("a", 5).await.unwrap();
        driver.raise_watermark("a", 3).await.unwrap();
        assert_eq!(driver.revision_watermark("a").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_storage_over_sql() {
        let storage = Storage::new(Backend::Sql(driver()));
        storage
            .create(&release("myapp", 1, ReleaseStatus::Superseded))
            .await
            .unwrap();
        storage
            .create(&release("myapp", 2, ReleaseStatus::Deployed))
            .await
            .unwrap();
        storage.delete("myapp", 2).await.unwrap();

        assert_eq!(storage.next_revision("myapp").await.unwrap(), 3);
        assert_eq!(storage.driver().name(), "sql");
    }
}
