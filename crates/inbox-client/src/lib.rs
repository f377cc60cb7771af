//! inbox-client library: native networking for inbox-core.
//!
//! Provides the WebSocket push channel, the REST collection endpoint, and
//! `SyncSession`, which runs both against one `SyncStore`.

pub mod config;
pub mod connection;
pub mod rest;
pub mod session;

// Re-export key types for convenience
pub use config::ClientConfig;
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState};
pub use rest::RestCollection;
pub use session::{SessionEvent, SyncSession};
