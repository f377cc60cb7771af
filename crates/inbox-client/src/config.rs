//! Configuration loading and management

use std::path::Path;

use anyhow::{Context, Result};
use inbox_core::{DEFAULT_POLL_INTERVAL_MS, ListQuery, SortOrder, Visibility};
use serde::{Deserialize, Serialize};

/// Placeholder in `socket_url` replaced by the resolved subject id.
pub const SUBJECT_PLACEHOLDER: &str = "{user_id}";

/// Main configuration for the sync client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the REST API (e.g. "http://127.0.0.1:8000/api/v1")
    pub api_base: String,

    /// Collection path under `api_base`
    pub collection: String,

    /// Segment between collection and id in delete URLs (None = `{collection}/{id}`)
    pub delete_segment: Option<String>,

    /// Push socket URL; may contain `{user_id}`. None disables the push channel.
    pub socket_url: Option<String>,

    /// Poll period in milliseconds
    pub poll_interval_ms: u64,

    /// Server-side ordering requested on every fetch
    pub ordering: SortOrder,

    /// Which items a non-privileged identity sees
    pub visibility: Visibility,

    /// Append pushed items to the store until the next reconciliation
    pub push_preview: bool,

    /// Most push messages kept in memory (None keeps every message)
    pub push_log_retain: Option<usize>,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            collection: "messages".to_string(),
            delete_segment: Some("delete".to_string()),
            socket_url: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ordering: SortOrder::CreatedDesc,
            visibility: Visibility::Owner,
            push_preview: false,
            push_log_retain: Some(1000),
            request_timeout_ms: 10_000,
        }
    }
}

fn default_api_base() -> String {
    "http://127.0.0.1:8000/api/v1".to_string()
}

impl ClientConfig {
    /// Load configuration from a JSON file, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ClientConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// List parameters sent with every fetch
    pub fn list_query(&self) -> ListQuery {
        ListQuery::new(self.ordering)
    }

    /// Socket URL for a subject, with the placeholder filled in
    pub fn socket_url_for(&self, subject: &str) -> Option<String> {
        self.socket_url
            .as_ref()
            .map(|url| url.replace(SUBJECT_PLACEHOLDER, subject))
    }
}
