//! REST implementation of `CollectionApi`.

use async_trait::async_trait;
use inbox_core::{CollectionApi, Item, ItemId, ListQuery, Operation, SyncError, SyncResult};
use reqwest::{Client, Response};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::ClientConfig;

/// Collection endpoint reached over HTTP with bearer authentication.
#[derive(Clone)]
pub struct RestCollection {
    http: Client,
    base_url: String,
    collection: String,
    delete_segment: Option<String>,
}

impl RestCollection {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, collection)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            collection: collection.into(),
            delete_segment: None,
        }
    }

    /// Build from configuration, with the configured request timeout.
    pub fn from_config(config: &ClientConfig) -> reqwest::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self::with_client(http, &config.api_base, &config.collection)
            .with_delete_segment(config.delete_segment.clone()))
    }

    /// Path segment between the collection and the id in delete URLs
    /// (`{collection}/delete/{id}`).
    pub fn with_delete_segment(mut self, segment: Option<String>) -> Self {
        self.delete_segment = segment;
        self
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.collection.trim_matches('/')
        )
    }

    /// `GET` target; the trailing slash matches the server's routes.
    pub fn list_url(&self) -> String {
        format!("{}/", self.collection_url())
    }

    /// `PUT` target for edits (`{collection}/{id}/`).
    pub fn update_url(&self, id: ItemId) -> String {
        format!("{}/{}/", self.collection_url(), id)
    }

    pub fn delete_url(&self, id: ItemId) -> String {
        match self.delete_segment.as_deref().map(|s| s.trim_matches('/')) {
            Some(segment) if !segment.is_empty() => {
                format!("{}/{}/{}", self.collection_url(), segment, id)
            }
            _ => format!("{}/{}", self.collection_url(), id),
        }
    }
}

/// Map a non-success response to a transport error carrying the status.
async fn check_status(operation: Operation, res: Response) -> SyncResult<Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(SyncError::status(operation, status.as_u16(), body))
}

fn transport(operation: Operation, e: reqwest::Error) -> SyncError {
    SyncError::Transport {
        operation,
        message: e.to_string(),
        status: e.status().map(|s| s.as_u16()),
    }
}

#[async_trait]
impl CollectionApi for RestCollection {
    async fn list(&self, credential: &str, query: &ListQuery) -> SyncResult<Vec<Item>> {
        let url = self.list_url();
        debug!("GET {} ordering={}", url, query.ordering);

        let res = self
            .http
            .get(&url)
            .bearer_auth(credential)
            .query(&query.to_params())
            .send()
            .await
            .map_err(|e| transport(Operation::Fetch, e))?;

        check_status(Operation::Fetch, res)
            .await?
            .json::<Vec<Item>>()
            .await
            .map_err(|e| transport(Operation::Fetch, e))
    }

    async fn delete(&self, credential: &str, id: ItemId) -> SyncResult<()> {
        let url = self.delete_url(id);
        debug!("DELETE {}", url);

        let res = self
            .http
            .delete(&url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| transport(Operation::Delete, e))?;

        check_status(Operation::Delete, res).await?;
        Ok(())
    }

    async fn update(
        &self,
        credential: &str,
        id: ItemId,
        patch: &Map<String, Value>,
    ) -> SyncResult<()> {
        let url = self.update_url(id);
        debug!("PUT {}", url);

        let res = self
            .http
            .put(&url)
            .bearer_auth(credential)
            .json(patch)
            .send()
            .await
            .map_err(|e| transport(Operation::Update, e))?;

        check_status(Operation::Update, res).await?;
        Ok(())
    }
}
