//! Canonical local copy of the collection plus its derived count.
//!
//! `SyncStore` has no network awareness. Every mutation updates the item list
//! and the count under one lock, so readers never see a count that disagrees
//! with the items. Views get a read-only `StoreView`; only the poller mutates.

use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::events::{EventBus, Subscription};
use crate::item::{Item, ItemId};

/// Consistent copy of the store contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub items: Vec<Item>,
    pub count: usize,
}

/// Change notification delivered after a mutation has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Replaced { count: usize },
    Removed { id: ItemId, count: usize },
    Appended { id: ItemId, count: usize },
    Updated { id: ItemId, count: usize },
}

impl StoreEvent {
    pub fn count(&self) -> usize {
        match self {
            StoreEvent::Replaced { count }
            | StoreEvent::Removed { count, .. }
            | StoreEvent::Appended { count, .. }
            | StoreEvent::Updated { count, .. } => *count,
        }
    }
}

#[derive(Default)]
struct StoreState {
    items: Vec<Item>,
    count: usize,
}

impl StoreState {
    fn recount(&mut self) -> usize {
        self.count = self.items.len();
        self.count
    }
}

/// Pure state container for the synchronized collection.
#[derive(Default)]
pub struct SyncStore {
    state: RwLock<StoreState>,
    bus: Arc<EventBus<StoreEvent>>,
}

impl SyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole collection.
    pub fn replace(&self, items: Vec<Item>) {
        let count = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.items = items;
            state.recount()
        };
        debug!("Store replaced, {} item(s)", count);
        self.bus.emit(&StoreEvent::Replaced { count });
    }

    /// Remove the item with `id`. Returns false when it was not present.
    pub fn remove_by_id(&self, id: ItemId) -> bool {
        let count = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let before = state.items.len();
            state.items.retain(|item| item.id != id);
            if state.items.len() == before {
                return false;
            }
            state.recount()
        };
        self.bus.emit(&StoreEvent::Removed { id, count });
        true
    }

    /// Append one item at the end.
    pub fn append(&self, item: Item) {
        let id = item.id;
        let count = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.items.push(item);
            state.recount()
        };
        self.bus.emit(&StoreEvent::Appended { id, count });
    }

    /// Replace the item with the same id in place, keeping its position.
    /// Returns false (and changes nothing) when no such item is present.
    pub fn update_item(&self, item: Item) -> bool {
        let id = item.id;
        let count = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let Some(slot) = state.items.iter_mut().find(|existing| existing.id == id) else {
                return false;
            };
            *slot = item;
            state.recount()
        };
        self.bus.emit(&StoreEvent::Updated { id, count });
        true
    }

    /// Copy of the item with `id`, if present.
    pub fn find(&self, id: ItemId) -> Option<Item> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    pub fn get(&self) -> StoreSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        StoreSnapshot {
            items: state.items.clone(),
            count: state.count,
        }
    }

    pub fn count(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).count
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .iter()
            .any(|item| item.id == id)
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Subscription<StoreEvent> {
        self.bus.subscribe(callback)
    }

    pub fn unsubscribe_all(&self) {
        self.bus.unsubscribe_all();
    }
}

/// Read-only handle to a `SyncStore` for view collaborators.
#[derive(Clone)]
pub struct StoreView {
    store: Arc<SyncStore>,
}

impl StoreView {
    pub fn new(store: Arc<SyncStore>) -> Self {
        Self { store }
    }

    pub fn get(&self) -> StoreSnapshot {
        self.store.get()
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Subscription<StoreEvent> {
        self.store.subscribe(callback)
    }
}
