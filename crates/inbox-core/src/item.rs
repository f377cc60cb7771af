//! Collection records as served by the REST endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::SubjectId;

/// Server-assigned item identifier.
pub type ItemId = i64;

/// Status value marking an item as active (as opposed to archived).
pub const STATUS_ACTIVE: &str = "AC";

/// A message or project record.
///
/// Field names follow the server's JSON. Fields this client does not model
/// are kept in `extra` so they survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,

    /// Owning subject. Projects carry members instead.
    #[serde(default, alias = "owner_id", skip_serializing_if = "Option::is_none")]
    pub owner: Option<SubjectId>,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub text: String,

    #[serde(alias = "created_at")]
    pub created: DateTime<Utc>,

    #[serde(
        rename = "update",
        alias = "updated",
        alias = "updated_at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updated: Option<DateTime<Utc>>,

    /// Subjects allowed to see a shared item.
    #[serde(rename = "project_users", default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<SubjectId>,

    /// `AC` (active) or `AR` (archived) for projects; absent for messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    /// Creates an item with only the fields reconciliation looks at.
    pub fn new(id: ItemId, owner: impl Into<SubjectId>, created: DateTime<Utc>) -> Self {
        Self {
            id,
            owner: Some(owner.into()),
            title: String::new(),
            text: String::new(),
            created,
            updated: None,
            members: Vec::new(),
            status: None,
            extra: Map::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Items without a status count as active.
    pub fn is_active(&self) -> bool {
        self.status.as_deref().is_none_or(|s| s == STATUS_ACTIVE)
    }

    pub fn is_owned_by(&self, subject: &SubjectId) -> bool {
        self.owner.as_ref() == Some(subject)
    }

    pub fn has_member(&self, subject: &SubjectId) -> bool {
        self.members.iter().any(|m| m == subject)
    }

    /// Shallow-merge a JSON object of field edits into a copy of this item.
    ///
    /// Top-level keys of `patch` replace the item's fields (server names,
    /// e.g. `project_users`). The id never changes.
    pub fn merged(&self, patch: &Map<String, Value>) -> serde_json::Result<Item> {
        let mut fields = match serde_json::to_value(self)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }

        let mut item: Item = serde_json::from_value(Value::Object(fields))?;
        item.id = self.id;
        Ok(item)
    }
}
