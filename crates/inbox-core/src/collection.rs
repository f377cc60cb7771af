//! CollectionApi trait for the remote REST collection.
//!
//! Implementations:
//! - `RestCollection` (in inbox-client) - reqwest against the HTTP endpoint
//! - `InMemoryCollection` - For testing

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Operation, SyncError, SyncResult};
use crate::item::{Item, ItemId};
use crate::query::ListQuery;

/// The server-owned collection, authenticated with a bearer credential.
#[async_trait]
pub trait CollectionApi: Send + Sync {
    /// Fetch the full collection in server order.
    async fn list(&self, credential: &str, query: &ListQuery) -> SyncResult<Vec<Item>>;

    /// Delete one item by id.
    async fn delete(&self, credential: &str, id: ItemId) -> SyncResult<()>;

    /// Apply field edits (a JSON object in server field names) to one item.
    async fn update(
        &self,
        credential: &str,
        id: ItemId,
        patch: &Map<String, Value>,
    ) -> SyncResult<()>;
}

/// In-memory collection for testing.
///
/// Failures can be injected per operation; an optional required credential
/// makes mismatched tokens fail with status 401.
#[derive(Default)]
pub struct InMemoryCollection {
    items: RwLock<Vec<Item>>,
    required_credential: Option<String>,
    fail_list: AtomicBool,
    fail_delete: AtomicBool,
    fail_update: AtomicBool,
    list_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl InMemoryCollection {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: RwLock::new(items),
            ..Default::default()
        }
    }

    /// Reject every call whose credential is not `credential`.
    pub fn with_required_credential(mut self, credential: impl Into<String>) -> Self {
        self.required_credential = Some(credential.into());
        self
    }

    pub fn set_items(&self, items: Vec<Item>) {
        *self.items.write().unwrap_or_else(|e| e.into_inner()) = items;
    }

    pub fn items(&self) -> Vec<Item> {
        self.items.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn check_credential(&self, operation: Operation, credential: &str) -> SyncResult<()> {
        match &self.required_credential {
            Some(expected) if expected != credential => {
                Err(SyncError::status(operation, 401, "invalid token"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CollectionApi for InMemoryCollection {
    async fn list(&self, credential: &str, _query: &ListQuery) -> SyncResult<Vec<Item>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_credential(Operation::Fetch, credential)?;
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(SyncError::transport(Operation::Fetch, "connection refused"));
        }
        Ok(self.items())
    }

    async fn delete(&self, credential: &str, id: ItemId) -> SyncResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_credential(Operation::Delete, credential)?;
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(SyncError::transport(Operation::Delete, "connection reset"));
        }
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|item| item.id != id);
        Ok(())
    }

    async fn update(
        &self,
        credential: &str,
        id: ItemId,
        patch: &Map<String, Value>,
    ) -> SyncResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check_credential(Operation::Update, credential)?;
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(SyncError::transport(Operation::Update, "connection reset"));
        }

        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = items.iter_mut().find(|item| item.id == id) else {
            return Err(SyncError::status(Operation::Update, 404, "not found"));
        };
        *slot = slot
            .merged(patch)
            .map_err(|e| SyncError::status(Operation::Update, 400, e.to_string()))?;
        Ok(())
    }
}
