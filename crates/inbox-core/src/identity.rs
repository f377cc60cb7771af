//! Credential decoding and identity resolution.
//!
//! The bearer credential is a JWT issued by the collection server. Only the
//! payload segment is read (the server verifies signatures); the client needs
//! it to learn who it is and whether it may see the whole collection.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::credentials::CredentialSource;
use crate::error::{SyncError, SyncResult};

/// Subject identifier as issued by the server: numeric primary keys or strings.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubjectId {
    Number(i64),
    Text(String),
}

impl SubjectId {
    /// The numeric value, for numbers and for text in canonical decimal form
    /// (`"7"` but not `"07"` or `"+7"`).
    pub fn as_number(&self) -> Option<i64> {
        match self {
            SubjectId::Number(n) => Some(*n),
            SubjectId::Text(s) => s
                .parse::<i64>()
                .ok()
                .filter(|n| n.to_string() == *s),
        }
    }
}

impl PartialEq for SubjectId {
    /// Numeric and canonical textual forms of the same id compare equal
    /// (`7 == "7"`); any other text only equals identical text.
    fn eq(&self, other: &Self) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => matches!(
                (self, other),
                (SubjectId::Text(a), SubjectId::Text(b)) if a == b
            ),
            _ => false,
        }
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectId::Number(n) => write!(f, "{n}"),
            SubjectId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SubjectId {
    fn from(id: i64) -> Self {
        SubjectId::Number(id)
    }
}

impl From<&str> for SubjectId {
    fn from(id: &str) -> Self {
        SubjectId::Text(id.to_string())
    }
}

/// Who the current credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: SubjectId,
    /// Privileged identities see every item, not only their own.
    pub is_privileged: bool,
}

/// Outcome of resolving a credential. Callers must handle both branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Authenticated(Identity),
    Unauthenticated,
}

impl AuthState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::Authenticated(identity) => Some(identity),
            AuthState::Unauthenticated => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }

    /// Converts into a result, mapping the gated branch to `SyncError::Unauthenticated`.
    pub fn into_result(self) -> SyncResult<Identity> {
        match self {
            AuthState::Authenticated(identity) => Ok(identity),
            AuthState::Unauthenticated => Err(SyncError::Unauthenticated),
        }
    }
}

/// Why a credential was rejected. Only used for logging; callers see
/// `AuthState::Unauthenticated`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("credential is not a three-part token")]
    Malformed,
    #[error("payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid claims JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("claims carry no user_id")]
    MissingSubject,
}

#[derive(Debug, Deserialize)]
struct Claims {
    user_id: Option<SubjectId>,
    #[serde(default)]
    is_superuser: bool,
    exp: Option<i64>,
}

/// Decoded claims that matter for identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCredential {
    pub identity: Identity,
    /// Expiry as unix seconds, when the token carries one.
    pub expires_at: Option<i64>,
}

impl DecodedCredential {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Decodes a credential's payload without checking expiry.
pub fn decode_credential(token: &str) -> Result<DecodedCredential, DecodeError> {
    let mut segments = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(DecodeError::Malformed);
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    let claims: Claims = serde_json::from_slice(&bytes)?;
    let subject_id = claims.user_id.ok_or(DecodeError::MissingSubject)?;

    Ok(DecodedCredential {
        identity: Identity {
            subject_id,
            is_privileged: claims.is_superuser,
        },
        expires_at: claims.exp,
    })
}

/// Resolves credentials to identities, caching the last decode.
///
/// The identity is derived once per credential value and re-derived when the
/// value changes. Expiry is re-checked on every call, so a cached identity
/// turns into `Unauthenticated` once its token lapses.
#[derive(Default)]
pub struct IdentityResolver {
    cache: Mutex<Option<(String, Option<DecodedCredential>)>>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a credential against the current time.
    pub fn resolve(&self, credential: Option<&str>) -> AuthState {
        self.resolve_at(credential, Utc::now().timestamp())
    }

    /// Reads the source's current value and resolves it.
    pub fn resolve_current(&self, source: &dyn CredentialSource) -> AuthState {
        self.resolve(source.current().as_deref())
    }

    /// Resolves a credential as of `now` (unix seconds).
    pub fn resolve_at(&self, credential: Option<&str>, now: i64) -> AuthState {
        let Some(token) = credential.filter(|t| !t.trim().is_empty()) else {
            return AuthState::Unauthenticated;
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let cached = match cache.as_ref() {
            Some((cached_token, decoded)) if cached_token == token => decoded.clone(),
            _ => {
                let decoded = match decode_credential(token) {
                    Ok(decoded) => Some(decoded),
                    Err(e) => {
                        debug!("Credential rejected: {}", e);
                        None
                    }
                };
                *cache = Some((token.to_string(), decoded.clone()));
                decoded
            }
        };

        match cached {
            Some(decoded) if decoded.is_expired(now) => {
                debug!(
                    "Credential for subject {} expired",
                    decoded.identity.subject_id
                );
                AuthState::Unauthenticated
            }
            Some(decoded) => AuthState::Authenticated(decoded.identity),
            None => AuthState::Unauthenticated,
        }
    }
}
