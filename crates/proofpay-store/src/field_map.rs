//! Logical field name to storage column maps
//!
//! Deployments whose store uses different column names configure a
//! [`FieldMapConfig`]. It is validated once against the [`EntityRegistry`];
//! after that every collection renames top-level keys on the way in and out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::registry::EntityRegistry;

/// `entity -> (logical field -> column)`, as loaded from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapConfig(pub HashMap<String, HashMap<String, String>>);

impl FieldMapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(
        mut self,
        entity: impl Into<String>,
        field: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.0
            .entry(entity.into())
            .or_default()
            .insert(field.into(), column.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(HashMap::is_empty)
    }

    /// Check every entry against the registry
    pub fn validate(&self, registry: &EntityRegistry) -> Result<()> {
        for (entity, fields) in &self.0 {
            let def = registry.get(entity).map_err(|_| {
                StoreError::InvalidFieldMap(format!("unknown entity {entity:?}"))
            })?;
            let mut columns: HashMap<&str, &str> = HashMap::new();
            for (field, column) in fields {
                if !def.has_field(field) {
                    return Err(StoreError::InvalidFieldMap(format!(
                        "{entity} has no field {field:?}"
                    )));
                }
                if column.trim().is_empty() {
                    let what = if def.is_required(field) {
                        "required field"
                    } else {
                        "field"
                    };
                    return Err(StoreError::InvalidFieldMap(format!(
                        "{entity} {what} {field:?} is mapped to an empty column"
                    )));
                }
                if let Some(other) = columns.insert(column.as_str(), field.as_str()) {
                    return Err(StoreError::InvalidFieldMap(format!(
                        "{entity} fields {other:?} and {field:?} share column {column:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolved map for one entity (identity when nothing is configured)
    pub fn for_entity(&self, entity: &str) -> EntityFieldMap {
        let to_column = self.0.get(entity).cloned().unwrap_or_default();
        let to_field = to_column
            .iter()
            .map(|(field, column)| (column.clone(), field.clone()))
            .collect();
        EntityFieldMap {
            to_column,
            to_field,
        }
    }
}

/// Two-way key renaming for one entity
#[derive(Debug, Clone, Default)]
pub struct EntityFieldMap {
    to_column: HashMap<String, String>,
    to_field: HashMap<String, String>,
}

impl EntityFieldMap {
    pub fn column<'a>(&'a self, field: &'a str) -> &'a str {
        self.to_column.get(field).map_or(field, String::as_str)
    }

    pub fn to_storage(&self, data: Map<String, Value>) -> Map<String, Value> {
        if self.to_column.is_empty() {
            return data;
        }
        data.into_iter()
            .map(|(k, v)| match self.to_column.get(&k) {
                Some(column) => (column.clone(), v),
                None => (k, v),
            })
            .collect()
    }

    pub fn from_storage(&self, data: Map<String, Value>) -> Map<String, Value> {
        if self.to_field.is_empty() {
            return data;
        }
        data.into_iter()
            .map(|(k, v)| match self.to_field.get(&k) {
                Some(field) => (field.clone(), v),
                None => (k, v),
            })
            .collect()
    }
}
