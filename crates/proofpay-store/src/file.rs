//! File-backed record store (offline mode)
//!
//! All entities live in one JSON document, rewritten in full through a temp
//! file and rename after every mutation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record::{Filter, ListQuery, Record};
use crate::store::{RecordStore, Tables};

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if the file is absent
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut tables: Tables = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Tables::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(StoreError::Io(format!("{}: {e}", path.display()))),
        };
        tables.restore_clock();
        info!(path = %path.display(), "Offline record store opened");
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(tables)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(format!("{}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Offline store persisted");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    fn backend_label(&self) -> &str {
        "file"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self, entity: &str, query: &ListQuery) -> Result<Vec<Record>> {
        Ok(self.tables.lock().await.query(entity, &Filter::new(), query))
    }

    async fn filter(
        &self,
        entity: &str,
        filter: &Filter,
        query: &ListQuery,
    ) -> Result<Vec<Record>> {
        Ok(self.tables.lock().await.query(entity, filter, query))
    }

    async fn get(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.tables.lock().await.get(entity, id))
    }

    async fn create(&self, entity: &str, data: Map<String, Value>) -> Result<Record> {
        let mut tables = self.tables.lock().await;
        let record = tables.insert(entity, data, &[])?;
        self.persist(&tables).await?;
        Ok(record)
    }

    async fn update(
        &self,
        entity: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Record> {
        let mut tables = self.tables.lock().await;
        let record = tables.update(entity, id, patch, expected_version)?;
        self.persist(&tables).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline").join("store.json");

        let store = FileStore::open(&path).await.unwrap();
        let created = store
            .create("WebhookEvent", json!({"psp_id": "pi_1"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        drop(store);

        let reopened = FileStore::open(&path).await.unwrap();
        let found = reopened
            .filter(
                "WebhookEvent",
                &Filter::new().eq("psp_id", "pi_1"),
                &ListQuery::new(),
            )
            .await
            .unwrap();
        assert_eq!(found, vec![created.clone()]);

        let next = reopened
            .create("WebhookEvent", json!({"psp_id": "pi_2"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(next.created_date > created.created_date);
    }

    #[tokio::test]
    async fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, b"[oops").await.unwrap();
        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Io(_))
        ));
    }
}
