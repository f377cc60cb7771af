//! inbox-core: runtime-agnostic core for keeping a local view of a
//! server-owned collection in sync.
//!
//! This crate provides:
//! - Credential decoding and identity gating (`IdentityResolver`)
//! - The canonical local collection (`SyncStore`) and its observers
//! - Push frame parsing and the append-only push log (`MessageDispatcher`)
//! - Poll-and-reconcile against the authoritative server (`PollingSync`)
//! - `CollectionApi` and `CredentialSource` trait abstractions
//!
//! Networking lives in inbox-client; nothing here spawns tasks or opens
//! sockets.

pub mod collection;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod identity;
pub mod item;
pub mod poller;
pub mod query;
pub mod reconcile;
pub mod store;

pub use collection::{CollectionApi, InMemoryCollection};
pub use credentials::{CredentialSource, FileCredentials, MemoryCredentials, StaticCredential};
pub use dispatcher::{DispatchEvent, MessageDispatcher, PushMessage};
pub use error::{Operation, ParseError, SyncError, SyncResult};
pub use events::{EventBus, Subscription};
pub use identity::{AuthState, Identity, IdentityResolver, SubjectId};
pub use item::{Item, ItemId};
pub use poller::{DEFAULT_POLL_INTERVAL_MS, PollingSync, TickReport};
pub use query::{ListQuery, SortOrder};
pub use reconcile::Visibility;
pub use store::{StoreEvent, StoreSnapshot, StoreView, SyncStore};
