//! Typed collections over a [`RecordStore`]
//!
//! A [`Collection<T>`] is bound to one registered entity. It serializes `T`
//! to the stored record, applies the entity's field map, and hides records
//! that lost a create race (`superseded_by` set) from every query.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::field_map::{EntityFieldMap, FieldMapConfig};
use crate::record::{Filter, ListQuery, Record, SUPERSEDED_BY_FIELD};
use crate::registry::{EntityDef, EntityRegistry};
use crate::store::RecordStore;

/// A decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct Document<T> {
    pub id: String,
    pub version: u64,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub superseded_by: Option<String>,
    pub value: T,
}

/// Factory for collections sharing one store, registry and field map
#[derive(Clone)]
pub struct Collections {
    store: Arc<dyn RecordStore>,
    registry: Arc<EntityRegistry>,
    field_maps: Arc<FieldMapConfig>,
}

impl Collections {
    /// Validates the field map against the registry
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: EntityRegistry,
        field_maps: FieldMapConfig,
    ) -> Result<Self> {
        field_maps.validate(&registry)?;
        Ok(Self {
            store,
            registry: Arc::new(registry),
            field_maps: Arc::new(field_maps),
        })
    }

    /// Standard registry, no column renames
    pub fn standard(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            registry: Arc::new(EntityRegistry::standard()),
            field_maps: Arc::new(FieldMapConfig::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn collection<T>(&self, entity: &str) -> Result<Collection<T>> {
        let def = self.registry.get(entity)?.clone();
        Ok(Collection {
            store: self.store.clone(),
            fields: self.field_maps.for_entity(def.name),
            def,
            _marker: PhantomData,
        })
    }
}

impl fmt::Debug for Collections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collections")
            .field("store", &self.store.backend_label())
            .field("entities", &self.registry.names().collect::<Vec<_>>())
            .finish()
    }
}

pub struct Collection<T> {
    store: Arc<dyn RecordStore>,
    def: EntityDef,
    fields: EntityFieldMap,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            def: self.def.clone(),
            fields: self.fields.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("entity", &self.def.name)
            .field("store", &self.store.backend_label())
            .finish()
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn entity(&self) -> &'static str {
        self.def.name
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Live records (superseded ones excluded)
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<Document<T>>> {
        self.filter(&Filter::new(), query).await
    }

    pub async fn filter(&self, filter: &Filter, query: &ListQuery) -> Result<Vec<Document<T>>> {
        let mut storage_filter = Filter::new();
        for (field, value) in &filter.0 {
            storage_filter = storage_filter.eq(self.fields.column(field), value.clone());
        }
        storage_filter = storage_filter.eq(self.fields.column(SUPERSEDED_BY_FIELD), Value::Null);

        let records = self
            .store
            .filter(self.def.name, &storage_filter, &self.storage_query(query))
            .await?;
        records.into_iter().map(|r| self.decode(r)).collect()
    }

    /// Earliest-created live record matching `filter`
    pub async fn find_one(&self, filter: &Filter) -> Result<Option<Document<T>>> {
        Ok(self
            .filter(filter, &ListQuery::oldest_first().limit(1))
            .await?
            .into_iter()
            .next())
    }

    /// Record by id, superseded or not
    pub async fn get(&self, id: &str) -> Result<Option<Document<T>>> {
        match self.store.get(self.def.name, id).await? {
            Some(record) => self.decode(record).map(Some),
            None => Ok(None),
        }
    }

    pub async fn create(&self, value: &T) -> Result<Document<T>> {
        let data = self.encode(value)?;
        self.create_data(data).await
    }

    /// Merge a patch of logical fields into the record
    pub async fn update(
        &self,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Document<T>> {
        let record = self
            .store
            .update(
                self.def.name,
                id,
                self.fields.to_storage(patch),
                expected_version,
            )
            .await?;
        self.decode(record)
    }

    /// Mark a record as replaced by `winner_id`
    pub async fn supersede(
        &self,
        id: &str,
        winner_id: &str,
        mut patch: Map<String, Value>,
    ) -> Result<Document<T>> {
        patch.insert(
            SUPERSEDED_BY_FIELD.to_string(),
            Value::String(winner_id.to_string()),
        );
        self.update(id, patch, None).await
    }

    pub(crate) fn encode(&self, value: &T) -> Result<Map<String, Value>> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Serialization(format!(
                "{} must serialize to an object, got {}",
                self.def.name,
                type_name(&other)
            ))),
        }
    }

    pub(crate) async fn create_data(&self, data: Map<String, Value>) -> Result<Document<T>> {
        self.def.check_required(&data)?;
        let record = self
            .store
            .create(self.def.name, self.fields.to_storage(data))
            .await?;
        self.decode(record)
    }

    fn storage_query(&self, query: &ListQuery) -> ListQuery {
        let mut mapped = query.clone();
        if let Some(sort) = &query.sort {
            mapped.sort = Some(match sort.strip_prefix('-') {
                Some(field) => format!("-{}", self.fields.column(field)),
                None => self.fields.column(sort).to_string(),
            });
        }
        if let Some(fields) = &query.fields {
            mapped.fields = Some(
                fields
                    .iter()
                    .map(|f| self.fields.column(f).to_string())
                    .collect(),
            );
        }
        mapped
    }

    fn decode(&self, record: Record) -> Result<Document<T>> {
        let mut data = self.fields.from_storage(record.data);
        let superseded_by = data
            .get(SUPERSEDED_BY_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        data.insert("id".to_string(), Value::String(record.id.clone()));
        data.insert(
            "created_date".to_string(),
            Value::String(record.created_date.to_rfc3339()),
        );
        let value = serde_json::from_value(Value::Object(data)).map_err(|e| StoreError::Decode {
            entity: self.def.name.to_string(),
            message: format!("{}: {e}", record.id),
        })?;
        Ok(Document {
            id: record.id,
            version: record.version,
            created_date: record.created_date,
            updated_date: record.updated_date,
            superseded_by,
            value,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::registry::{LEDGER_EVENT, SETTLEMENT_INDEX};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Mark {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        event_id: String,
        payout_batch_id: String,
    }

    fn mark(event_id: &str) -> Mark {
        Mark {
            id: String::new(),
            event_id: event_id.to_string(),
            payout_batch_id: "batch-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unknown_entity_fails_at_construction() {
        let collections = Collections::standard(Arc::new(MemoryStore::new()));
        let err = collections.collection::<Mark>("SettlementIndexes").unwrap_err();
        assert!(matches!(err, StoreError::UnknownEntity(_)));
    }

    #[tokio::test]
    async fn test_create_decodes_id_and_hides_superseded() {
        let collections = Collections::standard(Arc::new(MemoryStore::new()));
        let marks = collections.collection::<Mark>(SETTLEMENT_INDEX).unwrap();

        let a = marks.create(&mark("e1")).await.unwrap();
        let b = marks.create(&mark("e2")).await.unwrap();
        assert_eq!(a.value.id, a.id);

        marks.supersede(&b.id, &a.id, Map::new()).await.unwrap();
        let live = marks.list(&ListQuery::oldest_first()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, a.id);

        let superseded = marks.get(&b.id).await.unwrap().unwrap();
        assert_eq!(superseded.superseded_by.as_deref(), Some(a.id.as_str()));
    }

    #[tokio::test]
    async fn test_required_field_checked_on_create() {
        let collections = Collections::standard(Arc::new(MemoryStore::new()));
        let marks = collections.collection::<Mark>(SETTLEMENT_INDEX).unwrap();
        let err = marks
            .create_data(json!({"payout_batch_id": "b"}).as_object().cloned().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingField { .. }));
    }

    #[tokio::test]
    async fn test_field_map_applies_to_storage_and_filters() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Event {
            external_id: String,
            amount: String,
            currency: String,
        }

        let store = Arc::new(MemoryStore::new());
        let collections = Collections::new(
            store.clone(),
            EntityRegistry::standard(),
            FieldMapConfig::new().map(LEDGER_EVENT, "external_id", "ext_ref"),
        )
        .unwrap();
        let events = collections.collection::<Event>(LEDGER_EVENT).unwrap();
        events
            .create(&Event {
                external_id: "ch_1".into(),
                amount: "10".into(),
                currency: "USD".into(),
            })
            .await
            .unwrap();

        assert_eq!(store.dump(LEDGER_EVENT)[0].data["ext_ref"], "ch_1");
        let found = events
            .find_one(&Filter::new().eq("external_id", "ch_1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.value.external_id, "ch_1");
    }

    #[tokio::test]
    async fn test_invalid_field_map_rejected() {
        let err = Collections::new(
            Arc::new(MemoryStore::new()),
            EntityRegistry::standard(),
            FieldMapConfig::new().map("Nope", "a", "b"),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidFieldMap(_)));
    }
}
