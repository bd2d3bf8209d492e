//! In-memory record store
//!
//! Each operation is atomic on its own, but operations from concurrent
//! tasks interleave freely (every call yields to the scheduler first). That
//! makes it a faithful stand-in for a remote store without transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::record::{Filter, ListQuery, Record};
use crate::store::{RecordStore, Tables};

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unique: HashMap<String, Vec<String>>,
    unreachable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject creates that duplicate `field` within `entity`
    pub fn with_unique(mut self, entity: impl Into<String>, field: impl Into<String>) -> Self {
        self.unique
            .entry(entity.into())
            .or_default()
            .push(field.into());
        self
    }

    /// Simulate an outage: every call fails with a network error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every record of an entity, superseded ones included
    pub fn dump(&self, entity: &str) -> Vec<Record> {
        self.tables
            .lock()
            .query(entity, &Filter::new(), &ListQuery::oldest_first())
    }

    async fn enter(&self) -> Result<()> {
        tokio::task::yield_now().await;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Network("memory store marked unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend_label(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }

    async fn list(&self, entity: &str, query: &ListQuery) -> Result<Vec<Record>> {
        self.enter().await?;
        Ok(self.tables.lock().query(entity, &Filter::new(), query))
    }

    async fn filter(
        &self,
        entity: &str,
        filter: &Filter,
        query: &ListQuery,
    ) -> Result<Vec<Record>> {
        self.enter().await?;
        Ok(self.tables.lock().query(entity, filter, query))
    }

    async fn get(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        self.enter().await?;
        Ok(self.tables.lock().get(entity, id))
    }

    async fn create(&self, entity: &str, data: Map<String, Value>) -> Result<Record> {
        self.enter().await?;
        let unique = self.unique.get(entity).cloned().unwrap_or_default();
        self.tables.lock().insert(entity, data, &unique)
    }

    async fn update(
        &self,
        entity: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Record> {
        self.enter().await?;
        self.tables
            .lock()
            .update(entity, id, patch, expected_version)
    }
}
