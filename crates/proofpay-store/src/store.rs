//! The record store contract
//!
//! Every component that persists state depends only on [`RecordStore`].
//! Online (HTTP) and offline (file) backends implement the same signatures,
//! which is what lets [`FailoverStore`](crate::FailoverStore) swap them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::record::{strip_reserved, Filter, ListQuery, Record};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short name for logs (`memory`, `file`, `http`, ...)
    fn backend_label(&self) -> &str;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;

    /// Serving from a local fallback that other processes cannot see
    fn is_offline(&self) -> bool {
        false
    }

    async fn list(&self, entity: &str, query: &ListQuery) -> Result<Vec<Record>>;

    async fn filter(&self, entity: &str, filter: &Filter, query: &ListQuery)
        -> Result<Vec<Record>>;

    async fn get(&self, entity: &str, id: &str) -> Result<Option<Record>>;

    async fn create(&self, entity: &str, data: Map<String, Value>) -> Result<Record>;

    /// Merge `patch` into the record. With `expected_version`, the update
    /// only applies if the stored version still matches (compare-and-swap);
    /// otherwise it fails with [`StoreError::Conflict`].
    async fn update(
        &self,
        entity: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Record>;
}

/// In-process tables shared by the memory and file backends
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Tables {
    #[serde(default)]
    tables: HashMap<String, Vec<Record>>,
    #[serde(skip)]
    last_created: Option<DateTime<Utc>>,
}

impl Tables {
    pub(crate) fn query(&self, entity: &str, filter: &Filter, query: &ListQuery) -> Vec<Record> {
        let rows = self
            .tables
            .get(entity)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        query.apply(rows)
    }

    pub(crate) fn get(&self, entity: &str, id: &str) -> Option<Record> {
        self.tables
            .get(entity)
            .and_then(|rows| rows.iter().find(|r| r.id == id))
            .cloned()
    }

    /// Resume the creation clock after loading persisted tables
    pub(crate) fn restore_clock(&mut self) {
        self.last_created = self
            .tables
            .values()
            .flat_map(|rows| rows.iter().map(|r| r.created_date))
            .max();
    }

    /// Creation timestamps are strictly increasing so "earliest created"
    /// is a total order even for records created in the same microsecond
    fn next_created(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_created {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(stamp);
        stamp
    }

    pub(crate) fn insert(
        &mut self,
        entity: &str,
        data: Map<String, Value>,
        unique_fields: &[String],
    ) -> Result<Record> {
        let data = strip_reserved(data);
        if let Some(rows) = self.tables.get(entity) {
            for field in unique_fields {
                let Some(value) = data.get(field).filter(|v| !v.is_null()) else {
                    continue;
                };
                if rows.iter().any(|r| r.data.get(field) == Some(value)) {
                    return Err(StoreError::Conflict {
                        entity: entity.to_string(),
                        message: format!("duplicate {field} = {value}"),
                    });
                }
            }
        }

        let created = self.next_created();
        let record = Record {
            id: uuid::Uuid::new_v4().to_string(),
            created_date: created,
            updated_date: created,
            version: 1,
            data,
        };
        self.tables
            .entry(entity.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    pub(crate) fn update(
        &mut self,
        entity: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Record> {
        let record = self
            .tables
            .get_mut(entity)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| StoreError::NotFound {
                entity: entity.to_string(),
                id: id.to_string(),
            })?;

        if let Some(expected) = expected_version {
            if record.version != expected {
                return Err(StoreError::Conflict {
                    entity: entity.to_string(),
                    message: format!(
                        "record {id} is at version {}, expected {expected}",
                        record.version
                    ),
                });
            }
        }

        for (key, value) in strip_reserved(patch) {
            record.data.insert(key, value);
        }
        record.version += 1;
        record.updated_date = Utc::now().max(record.created_date);
        Ok(record.clone())
    }
}
