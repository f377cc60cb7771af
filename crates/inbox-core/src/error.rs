//! Error taxonomy shared by every sync component.
//!
//! Each variant names a distinct failure class so the owning session (and any
//! view built on top of it) can tell an unauthenticated user apart from a
//! flaky network or a malformed push frame.

use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// The operation a transport failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Listing the remote collection.
    Fetch,
    /// Deleting one remote item.
    Delete,
    /// Editing one remote item.
    Update,
    /// Socket handshake.
    Connect,
    /// Writing a socket frame.
    Send,
    /// Reading a socket frame.
    Receive,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Fetch => "fetch",
            Operation::Delete => "delete",
            Operation::Update => "update",
            Operation::Connect => "connect",
            Operation::Send => "send",
            Operation::Receive => "receive",
        };
        f.write_str(name)
    }
}

/// An inbound frame that could not be parsed as structured data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed frame ({len} bytes): {reason}")]
pub struct ParseError {
    /// Why the frame was rejected.
    pub reason: String,
    /// Size of the rejected frame in bytes.
    pub len: usize,
}

/// Errors surfaced by the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// No credential, or one that failed to decode or has expired.
    #[error("not authenticated")]
    Unauthenticated,

    /// Malformed inbound frame.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Socket or HTTP failure. Never retried by the core.
    #[error("{operation} failed: {message}")]
    Transport {
        /// Which operation failed.
        operation: Operation,
        /// Human-readable cause.
        message: String,
        /// HTTP status, when the server answered at all.
        status: Option<u16>,
    },

    /// Send attempted on a connection that is not open.
    #[error("connection {connection} is not open")]
    NotConnected {
        /// Raw id of the connection handle.
        connection: u64,
    },

    /// The operation is reserved for privileged identities.
    #[error("{operation} requires a privileged identity")]
    Forbidden {
        /// The refused operation.
        operation: Operation,
    },

    /// An edit that cannot be applied to an item.
    #[error("invalid patch: {reason}")]
    InvalidPatch {
        /// Why the patch was refused.
        reason: String,
    },

    /// A second poll timer was requested while one is active.
    #[error("polling is already running")]
    AlreadyRunning,
}

impl SyncError {
    /// Creates a transport error without an HTTP status.
    pub fn transport(operation: Operation, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
            status: None,
        }
    }

    /// Creates a transport error for a non-success HTTP response.
    pub fn status(operation: Operation, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = if body.is_empty() {
            format!("unexpected status {status}")
        } else {
            format!("unexpected status {status}: {body}")
        };
        Self::Transport {
            operation,
            message,
            status: Some(status),
        }
    }

    /// Returns true for socket/HTTP failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }

    /// The operation a transport failure happened in, if any.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            SyncError::Transport { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}
