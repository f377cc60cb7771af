//! Poll-and-reconcile: the authoritative update channel.
//!
//! Each tick fetches the full remote collection, keeps what the current
//! identity may see, orders it newest first, and replaces the store. The
//! poller is runtime-agnostic; the owning session drives `tick` from a timer.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::collection::CollectionApi;
use crate::credentials::CredentialSource;
use crate::error::{Operation, SyncError, SyncResult};
use crate::identity::{AuthState, Identity, IdentityResolver};
use crate::item::{Item, ItemId};
use crate::query::ListQuery;
use crate::reconcile::{Visibility, is_visible, reconcile};
use crate::store::SyncStore;

/// Reference poll period.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Outcome of one successful tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// The store was replaced with a fresh snapshot.
    Reconciled {
        /// Items returned by the server.
        fetched: usize,
        /// Items kept after filtering.
        kept: usize,
    },
    /// Another tick was still in flight; nothing was fetched.
    Skipped,
}

/// Resets the in-flight flag when the tick finishes or is cancelled.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps a `SyncStore` reconciled against the remote collection.
pub struct PollingSync {
    collection: Arc<dyn CollectionApi>,
    credentials: Arc<dyn CredentialSource>,
    resolver: IdentityResolver,
    store: Arc<SyncStore>,
    query: ListQuery,
    visibility: Visibility,
    in_flight: AtomicBool,
}

impl PollingSync {
    pub fn new(
        collection: Arc<dyn CollectionApi>,
        credentials: Arc<dyn CredentialSource>,
        store: Arc<SyncStore>,
    ) -> Self {
        Self {
            collection,
            credentials,
            resolver: IdentityResolver::new(),
            store,
            query: ListQuery::default(),
            visibility: Visibility::default(),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_query(mut self, query: ListQuery) -> Self {
        self.query = query;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Resolve the credential currently held by the source.
    pub fn identity(&self) -> AuthState {
        self.resolver.resolve_current(self.credentials.as_ref())
    }

    /// Whether a tick is currently fetching.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn authenticate(&self) -> SyncResult<(String, Identity)> {
        let credential = self.credentials.current();
        let identity = self.resolver.resolve(credential.as_deref()).into_result()?;
        let credential = credential.ok_or(SyncError::Unauthenticated)?;
        Ok((credential, identity))
    }

    /// Run one reconciliation.
    ///
    /// Fails with `Unauthenticated` when there is no valid credential, or with
    /// a transport error when the fetch fails; the store is untouched in both
    /// cases. Returns `Skipped` if a previous tick has not finished.
    pub async fn tick(&self) -> SyncResult<TickReport> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Previous fetch still in flight, skipping tick");
            return Ok(TickReport::Skipped);
        };

        let (credential, identity) = self.authenticate()?;

        let items = match self.collection.list(&credential, &self.query).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Fetch failed, keeping {} cached item(s): {}", self.store.count(), e);
                return Err(e);
            }
        };

        let fetched = items.len();
        let visible = reconcile(items, &identity, self.visibility);
        let kept = visible.len();
        self.store.replace(visible);

        debug!(
            "Reconciled {} of {} item(s) for subject {}",
            kept, fetched, identity.subject_id
        );
        Ok(TickReport::Reconciled { fetched, kept })
    }

    /// Delete an item remotely, then drop it from the store right away.
    ///
    /// On failure the error is returned and the store is left as it was.
    pub async fn remove(&self, id: ItemId) -> SyncResult<()> {
        let (credential, _identity) = self.authenticate()?;

        if let Err(e) = self.collection.delete(&credential, id).await {
            warn!("Delete of item {} failed: {}", id, e);
            return Err(e);
        }

        if self.store.remove_by_id(id) {
            info!("Deleted item {}", id);
        } else {
            debug!("Deleted item {} was not in the local store", id);
        }
        Ok(())
    }

    /// Edit an item remotely, then merge the edit into the store right away.
    ///
    /// Only privileged identities may edit; others get `Forbidden` without a
    /// request being made. `patch` must be a JSON object of server field
    /// names and must produce a valid item when merged into the local copy.
    pub async fn update(&self, id: ItemId, patch: &Value) -> SyncResult<()> {
        let (credential, identity) = self.authenticate()?;
        if !identity.is_privileged {
            return Err(SyncError::Forbidden {
                operation: Operation::Update,
            });
        }
        let Some(patch) = patch.as_object() else {
            return Err(SyncError::InvalidPatch {
                reason: "expected a JSON object".to_string(),
            });
        };

        let merged = match self.store.find(id) {
            Some(current) => Some(current.merged(patch).map_err(|e| SyncError::InvalidPatch {
                reason: e.to_string(),
            })?),
            None => None,
        };

        if let Err(e) = self.collection.update(&credential, id, patch).await {
            warn!("Update of item {} failed: {}", id, e);
            return Err(e);
        }

        if merged.is_some_and(|item| self.store.update_item(item)) {
            info!("Updated item {}", id);
        } else {
            debug!("Updated item {} was not in the local store", id);
        }
        Ok(())
    }

    /// Show a pushed item before the next reconciliation confirms it.
    ///
    /// Appends only items the identity may see and that are not already in
    /// the store. The next tick's full replace supersedes the preview.
    pub fn apply_push_preview(&self, item: Item) -> bool {
        let AuthState::Authenticated(identity) = self.identity() else {
            return false;
        };
        if !is_visible(&item, &identity, self.visibility) || self.store.contains(item.id) {
            return false;
        }
        debug!("Previewing pushed item {}", item.id);
        self.store.append(item);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::InMemoryCollection;
    use crate::credentials::MemoryCredentials;
    use crate::identity::tests::make_token;
    use crate::item::Item;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn user_token(subject: &str, privileged: bool) -> String {
        make_token(json!({"user_id": subject, "is_superuser": privileged}))
    }

    fn poller_with(
        collection: Arc<dyn CollectionApi>,
        token: Option<String>,
    ) -> (PollingSync, Arc<SyncStore>, Arc<MemoryCredentials>) {
        let store = Arc::new(SyncStore::new());
        let credentials = Arc::new(MemoryCredentials::new(token));
        let poller = PollingSync::new(collection, credentials.clone(), Arc::clone(&store));
        (poller, store, credentials)
    }

    #[tokio::test]
    async fn test_tick_filters_to_owner() {
        let collection = Arc::new(InMemoryCollection::new(vec![
            Item::new(1, "u1", day(1)),
            Item::new(2, "u2", day(2)),
        ]));
        let (poller, store, _) = poller_with(collection, Some(user_token("u1", false)));

        let report = poller.tick().await.unwrap();

        assert_eq!(report, TickReport::Reconciled { fetched: 2, kept: 1 });
        let snapshot = store.get();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.items[0].id, 1);
    }

    #[tokio::test]
    async fn test_tick_privileged_sees_all() {
        let collection = Arc::new(InMemoryCollection::new(vec![
            Item::new(1, "u1", day(1)),
            Item::new(2, "u2", day(2)),
        ]));
        let (poller, store, _) = poller_with(collection, Some(user_token("u1", true)));

        poller.tick().await.unwrap();

        assert_eq!(store.count(), 2);
    }

    #[tokio::test]
    async fn test_tick_sorts_newest_first() {
        let collection = Arc::new(InMemoryCollection::new(vec![
            Item::new(3, "u1", day(3)),
            Item::new(1, "u1", day(1)),
            Item::new(2, "u1", day(2)),
        ]));
        let (poller, store, _) = poller_with(collection, Some(user_token("u1", false)));

        poller.tick().await.unwrap();

        let created: Vec<_> = store.get().items.iter().map(|i| i.created).collect();
        assert_eq!(created, vec![day(3), day(2), day(1)]);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_stale_state() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, store, _) =
            poller_with(collection.clone(), Some(user_token("u1", false)));

        poller.tick().await.unwrap();
        collection.fail_list(true);

        let err = poller.tick().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(store.count(), 1);

        // A failed tick does not prevent the next one
        collection.fail_list(false);
        collection.set_items(Vec::new());
        poller.tick().await.unwrap();
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_unauthenticated_tick_does_not_fetch() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, store, credentials) = poller_with(collection.clone(), None);

        assert_eq!(poller.tick().await, Err(SyncError::Unauthenticated));

        credentials.set("garbage");
        assert_eq!(poller.tick().await, Err(SyncError::Unauthenticated));

        assert_eq!(collection.list_calls(), 0);
        assert_eq!(store.count(), 0);
        assert_eq!(poller.identity(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_full_replace_discards_local_state() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, store, _) = poller_with(collection, Some(user_token("u1", false)));

        poller.tick().await.unwrap();
        assert!(poller.apply_push_preview(Item::new(99, "u1", day(5))));
        assert_eq!(store.count(), 2);

        poller.tick().await.unwrap();

        assert_eq!(store.count(), 1);
        assert!(!store.contains(99));
    }

    #[tokio::test]
    async fn test_push_preview_respects_visibility_and_duplicates() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, store, _) = poller_with(collection, Some(user_token("u1", false)));
        poller.tick().await.unwrap();

        assert!(!poller.apply_push_preview(Item::new(2, "u2", day(2))));
        assert!(!poller.apply_push_preview(Item::new(1, "u1", day(1))));
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn test_remove_success_is_optimistic() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(5, "u1", day(1))]));
        let (poller, store, _) =
            poller_with(collection.clone(), Some(user_token("u1", false)));
        poller.tick().await.unwrap();
        assert_eq!(store.count(), 1);

        poller.remove(5).await.unwrap();

        let snapshot = store.get();
        assert!(snapshot.items.is_empty());
        assert_eq!(snapshot.count, 0);
        assert_eq!(collection.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_remove_failure_leaves_store() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(5, "u1", day(1))]));
        let (poller, store, _) =
            poller_with(collection.clone(), Some(user_token("u1", false)));
        poller.tick().await.unwrap();
        collection.fail_delete(true);

        let err = poller.remove(5).await.unwrap_err();

        assert!(err.is_transport());
        let snapshot = store.get();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.items[0].id, 5);
    }

    #[tokio::test]
    async fn test_remove_unauthenticated_issues_no_request() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(5, "u1", day(1))]));
        let (poller, _, _) = poller_with(collection.clone(), None);

        assert_eq!(poller.remove(5).await, Err(SyncError::Unauthenticated));
        assert_eq!(collection.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_credential_is_transport_error() {
        let collection = Arc::new(
            InMemoryCollection::new(vec![Item::new(1, "u1", day(1))])
                .with_required_credential("server-issued"),
        );
        let (poller, store, _) = poller_with(collection, Some(user_token("u1", false)));

        match poller.tick().await {
            Err(SyncError::Transport { status, .. }) => assert_eq!(status, Some(401)),
            other => panic!("Expected 401 transport error, got {:?}", other),
        }
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_update_merges_in_place() {
        let collection = Arc::new(InMemoryCollection::new(vec![
            Item::new(1, "u1", day(1)).with_title("first"),
            Item::new(2, "u2", day(2)).with_title("second"),
        ]));
        let (poller, store, _) =
            poller_with(collection.clone(), Some(user_token("admin", true)));
        poller.tick().await.unwrap();

        poller
            .update(1, &json!({"title": "renamed", "status": "AR"}))
            .await
            .unwrap();

        let snapshot = store.get();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(snapshot.items[1].title, "renamed");
        assert_eq!(snapshot.items[1].status.as_deref(), Some("AR"));
        assert_eq!(collection.items()[0].title, "renamed");
        assert_eq!(collection.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_update_requires_privilege() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, store, _) =
            poller_with(collection.clone(), Some(user_token("u1", false)));
        poller.tick().await.unwrap();

        let err = poller.update(1, &json!({"title": "mine"})).await.unwrap_err();

        assert_eq!(
            err,
            SyncError::Forbidden {
                operation: Operation::Update
            }
        );
        assert_eq!(collection.update_calls(), 0);
        assert_eq!(store.get().items[0].title, "");
    }

    #[tokio::test]
    async fn test_update_failure_leaves_store() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, store, _) =
            poller_with(collection.clone(), Some(user_token("admin", true)));
        poller.tick().await.unwrap();
        collection.fail_update(true);

        let err = poller.update(1, &json!({"title": "x"})).await.unwrap_err();

        assert_eq!(err.operation(), Some(Operation::Update));
        assert_eq!(store.get().items[0].title, "");
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_patch_before_request() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, _, _) = poller_with(collection.clone(), Some(user_token("admin", true)));
        poller.tick().await.unwrap();

        assert!(matches!(
            poller.update(1, &json!(["title"])).await,
            Err(SyncError::InvalidPatch { .. })
        ));
        assert!(matches!(
            poller.update(1, &json!({"created": "soon"})).await,
            Err(SyncError::InvalidPatch { .. })
        ));
        assert_eq!(collection.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_unauthenticated_issues_no_request() {
        let collection = Arc::new(InMemoryCollection::new(vec![Item::new(1, "u1", day(1))]));
        let (poller, _, _) = poller_with(collection.clone(), None);

        assert_eq!(
            poller.update(1, &json!({"title": "x"})).await,
            Err(SyncError::Unauthenticated)
        );
        assert_eq!(collection.update_calls(), 0);
    }

    /// Collection whose `list` blocks until released.
    struct SlowCollection {
        started: Notify,
        release: Notify,
        calls: AtomicUsize,
        items: Vec<Item>,
    }

    #[async_trait]
    impl CollectionApi for SlowCollection {
        async fn list(&self, _credential: &str, _query: &ListQuery) -> SyncResult<Vec<Item>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(self.items.clone())
        }

        async fn delete(&self, _credential: &str, _id: ItemId) -> SyncResult<()> {
            Ok(())
        }

        async fn update(
            &self,
            _credential: &str,
            _id: ItemId,
            _patch: &serde_json::Map<String, Value>,
        ) -> SyncResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_single_flight() {
        let slow = Arc::new(SlowCollection {
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
            items: vec![Item::new(1, "u1", day(1))],
        });
        let (poller, store, _) = poller_with(slow.clone(), Some(user_token("u1", false)));
        let poller = Arc::new(poller);

        let first = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.tick().await })
        };
        slow.started.notified().await;
        assert!(poller.is_in_flight());

        let second = poller.tick().await.unwrap();
        assert_eq!(second, TickReport::Skipped);

        slow.release.notify_one();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first, TickReport::Reconciled { fetched: 1, kept: 1 });
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.count(), 1);
        assert!(!poller.is_in_flight());
    }

    #[tokio::test]
    async fn test_cancelled_tick_releases_flight() {
        let slow = Arc::new(SlowCollection {
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
            items: Vec::new(),
        });
        let (poller, _, _) = poller_with(slow.clone(), Some(user_token("u1", false)));
        let poller = Arc::new(poller);

        let pending = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.tick().await })
        };
        slow.started.notified().await;
        pending.abort();
        let _ = pending.await;

        assert!(!poller.is_in_flight());
    }
}
