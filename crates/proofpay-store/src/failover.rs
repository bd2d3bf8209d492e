//! Online store with a one-way fallback to an offline store
//!
//! The first network-shaped failure of the primary flips the store offline
//! for the rest of the process; the failed call is replayed on the fallback.
//! Other errors (conflicts, not-found, backend 4xx) are returned as-is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::record::{Filter, ListQuery, Record};
use crate::store::RecordStore;

pub struct FailoverStore {
    primary: Arc<dyn RecordStore>,
    fallback: Arc<dyn RecordStore>,
    offline: AtomicBool,
}

impl FailoverStore {
    pub fn new(primary: Arc<dyn RecordStore>, fallback: Arc<dyn RecordStore>) -> Self {
        Self {
            primary,
            fallback,
            offline: AtomicBool::new(false),
        }
    }

    /// Switch to the fallback without waiting for a failure
    pub fn go_offline(&self, reason: &str) {
        if !self.offline.swap(true, Ordering::SeqCst) {
            warn!(
                primary = self.primary.backend_label(),
                fallback = self.fallback.backend_label(),
                reason = %reason,
                "Record store switching to offline mode"
            );
        }
    }

    fn active(&self) -> &Arc<dyn RecordStore> {
        if self.is_offline() {
            &self.fallback
        } else {
            &self.primary
        }
    }

    fn should_fail_over(&self, result: &Result<impl Sized>) -> bool {
        match result {
            Err(e) if e.is_network() && !self.is_offline() => {
                self.go_offline(&e.to_string());
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RecordStore for FailoverStore {
    fn backend_label(&self) -> &str {
        self.active().backend_label()
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<()> {
        let result = self.active().ping().await;
        if self.should_fail_over(&result) {
            return self.fallback.ping().await;
        }
        result
    }

    async fn list(&self, entity: &str, query: &ListQuery) -> Result<Vec<Record>> {
        let result = self.active().list(entity, query).await;
        if self.should_fail_over(&result) {
            return self.fallback.list(entity, query).await;
        }
        result
    }

    async fn filter(
        &self,
        entity: &str,
        filter: &Filter,
        query: &ListQuery,
    ) -> Result<Vec<Record>> {
        let result = self.active().filter(entity, filter, query).await;
        if self.should_fail_over(&result) {
            return self.fallback.filter(entity, filter, query).await;
        }
        result
    }

    async fn get(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        let result = self.active().get(entity, id).await;
        if self.should_fail_over(&result) {
            return self.fallback.get(entity, id).await;
        }
        result
    }

    async fn create(&self, entity: &str, data: Map<String, Value>) -> Result<Record> {
        let result = self.active().create(entity, data.clone()).await;
        if self.should_fail_over(&result) {
            return self.fallback.create(entity, data).await;
        }
        result
    }

    async fn update(
        &self,
        entity: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Record> {
        let result = self
            .active()
            .update(entity, id, patch.clone(), expected_version)
            .await;
        if self.should_fail_over(&result) {
            return self
                .fallback
                .update(entity, id, patch, expected_version)
                .await;
        }
        result
    }
}

impl std::fmt::Debug for FailoverStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverStore")
            .field("primary", &self.primary.backend_label())
            .field("fallback", &self.fallback.backend_label())
            .field("offline", &self.is_offline())
            .finish()
    }
}
