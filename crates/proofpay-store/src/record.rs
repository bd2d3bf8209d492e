//! Untyped store records and queries

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields owned by the store; stripped from caller data on write
pub const RESERVED_FIELDS: [&str; 4] = ["id", "created_date", "updated_date", "version"];

/// Field pointing at the record that replaced a losing duplicate
pub const SUPERSEDED_BY_FIELD: &str = "superseded_by";

/// A record as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    /// Incremented on every update; basis for compare-and-swap
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Record {
    /// Field value, including the store-owned `id` and timestamps
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "created_date" => Some(Value::String(self.created_date.to_rfc3339())),
            "updated_date" => Some(Value::String(self.updated_date.to_rfc3339())),
            "version" => Some(Value::from(self.version)),
            _ => self.data.get(name).cloned(),
        }
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    /// Has this record lost a create race to another record?
    pub fn is_superseded(&self) -> bool {
        self.data
            .get(SUPERSEDED_BY_FIELD)
            .is_some_and(|v| !v.is_null())
    }

    /// Keep only the given data fields
    pub fn project(mut self, fields: &[String]) -> Self {
        self.data.retain(|k, _| fields.iter().any(|f| f == k));
        self
    }
}

/// Remove store-owned keys from caller data
pub fn strip_reserved(mut data: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_FIELDS {
        data.remove(key);
    }
    data
}

/// Equality filter over record fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter(pub Map<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| match record.field(field) {
                Some(actual) => values_equal(&actual, expected),
                None => expected.is_null(),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Sort, paging and projection for list/filter calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Field name, `-` prefix for descending (e.g. `-created_date`)
    pub sort: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub fields: Option<Vec<String>>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest first
    pub fn oldest_first() -> Self {
        Self::new().sort("created_date")
    }

    /// Newest first
    pub fn newest_first() -> Self {
        Self::new().sort("-created_date")
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Sort, page and project a set of records in place
    pub fn apply(&self, mut records: Vec<Record>) -> Vec<Record> {
        if let Some(sort) = &self.sort {
            let (field, descending) = match sort.strip_prefix('-') {
                Some(field) => (field, true),
                None => (sort.as_str(), false),
            };
            records.sort_by(|a, b| {
                let ord = compare_field(a, b, field).then_with(|| a.id.cmp(&b.id));
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        let paged = records.into_iter().skip(self.offset);
        let paged: Vec<Record> = match self.limit {
            Some(limit) => paged.take(limit).collect(),
            None => paged.collect(),
        };
        match &self.fields {
            Some(fields) => paged.into_iter().map(|r| r.project(fields)).collect(),
            None => paged,
        }
    }
}

fn compare_field(a: &Record, b: &Record, field: &str) -> Ordering {
    match field {
        "created_date" => a.created_date.cmp(&b.created_date),
        "updated_date" => a.updated_date.cmp(&b.updated_date),
        _ => compare_values(a.data.get(field), b.data.get(field)),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
