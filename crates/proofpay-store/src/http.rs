//! Remote record store over HTTP
//!
//! Endpoints:
//!
//! | Operation | Request |
//! |---|---|
//! | list / filter | `GET /entities/{entity}?q=<json>&sort=&limit=&skip=&fields=a,b` |
//! | get | `GET /entities/{entity}/{id}` |
//! | create | `POST /entities/{entity}` |
//! | update | `PUT /entities/{entity}/{id}`, `If-Match: <version>` for CAS |
//! | ping | `GET /health` |
//!
//! 404 maps to not-found; 409 and 412 map to a conflict.

use async_trait::async_trait;
use proofpay_resilience::RetryingClient;
use reqwest::{Method, Url};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::record::{Filter, ListQuery, Record};
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct HttpRecordStore {
    client: RetryingClient,
}

impl HttpRecordStore {
    pub fn new(client: RetryingClient) -> Self {
        Self { client }
    }

    fn query_path(entity: &str, filter: Option<&Filter>, query: &ListQuery) -> Result<String> {
        let mut url = Url::parse("http://store.invalid/")
            .and_then(|base| base.join(&format!("entities/{entity}")))
            .map_err(|e| StoreError::Serialization(format!("bad entity path: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(filter) = filter.filter(|f| !f.is_empty()) {
                pairs.append_pair("q", &Value::Object(filter.0.clone()).to_string());
            }
            if let Some(sort) = &query.sort {
                pairs.append_pair("sort", sort);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if query.offset > 0 {
                pairs.append_pair("skip", &query.offset.to_string());
            }
            if let Some(fields) = &query.fields {
                pairs.append_pair("fields", &fields.join(","));
            }
        }
        Ok(match url.query().filter(|q| !q.is_empty()) {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        })
    }

    async fn fetch_records(
        &self,
        entity: &str,
        filter: Option<&Filter>,
        query: &ListQuery,
    ) -> Result<Vec<Record>> {
        let path = Self::query_path(entity, filter, query)?;
        let body = self
            .client
            .get_json(&path)
            .await
            .map_err(|e| StoreError::from_http(entity, None, e))?;
        let items = match body {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        items
            .into_iter()
            .map(|item| decode(entity, item))
            .collect()
    }
}

fn decode(entity: &str, value: Value) -> Result<Record> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode {
        entity: entity.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    fn backend_label(&self) -> &str {
        "http"
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .get_json("/health")
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_http("health", None, e))
    }

    async fn list(&self, entity: &str, query: &ListQuery) -> Result<Vec<Record>> {
        self.fetch_records(entity, None, query).await
    }

    async fn filter(
        &self,
        entity: &str,
        filter: &Filter,
        query: &ListQuery,
    ) -> Result<Vec<Record>> {
        self.fetch_records(entity, Some(filter), query).await
    }

    async fn get(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        match self
            .client
            .get_json(&format!("/entities/{entity}/{id}"))
            .await
            .map_err(|e| StoreError::from_http(entity, Some(id), e))
        {
            Ok(value) => decode(entity, value).map(Some),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, entity: &str, data: Map<String, Value>) -> Result<Record> {
        let value = self
            .client
            .send_json(
                Method::POST,
                &format!("/entities/{entity}"),
                Some(&Value::Object(data)),
                None,
            )
            .await
            .map_err(|e| StoreError::from_http(entity, None, e))?;
        decode(entity, value)
    }

    async fn update(
        &self,
        entity: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Record> {
        let version = expected_version.map(|v| v.to_string());
        let headers: Vec<(&str, &str)> = version
            .as_deref()
            .map(|v| vec![("If-Match", v)])
            .unwrap_or_default();
        let value = self
            .client
            .send_json_with_headers(
                Method::PUT,
                &format!("/entities/{entity}/{id}"),
                Some(&Value::Object(patch)),
                &headers,
            )
            .await
            .map_err(|e| StoreError::from_http(entity, Some(id), e))?;
        decode(entity, value)
    }
}
