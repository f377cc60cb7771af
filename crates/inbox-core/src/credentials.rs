//! CredentialSource trait: where the bearer credential is read from.
//!
//! Implementations:
//! - `MemoryCredentials` - Settable in-process store (login/logout flows, tests)
//! - `StaticCredential` - Fixed value supplied at startup
//! - `FileCredentials` - Token file re-read on every call

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// An external store holding the current bearer credential.
///
/// The value is read at resolver invocation time and may change (or vanish)
/// between reads.
pub trait CredentialSource: Send + Sync {
    /// Read the current credential, if any.
    fn current(&self) -> Option<String>;
}

/// In-memory credential store.
#[derive(Default)]
pub struct MemoryCredentials {
    token: RwLock<Option<String>>,
}

impl MemoryCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Replace the stored credential.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
    }

    /// Forget the stored credential (logout).
    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl CredentialSource for MemoryCredentials {
    fn current(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A credential fixed at construction time.
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

impl CredentialSource for StaticCredential {
    fn current(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the credential from a file on every call.
///
/// A missing or empty file means "no credential".
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialSource for FileCredentials {
    fn current(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let token = content.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) => {
                debug!("No credential at {:?}: {}", self.path, e);
                None
            }
        }
    }
}
