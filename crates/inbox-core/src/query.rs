//! Server-side list parameters: ordering and date-range filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Server-side ordering accepted by the collection endpoint's `ordering`
/// query parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SortOrder {
    CreatedAsc,
    #[default]
    CreatedDesc,
    UpdatedAsc,
    UpdatedDesc,
    TitleAsc,
    TitleDesc,
}

impl SortOrder {
    pub const ALL: [SortOrder; 6] = [
        SortOrder::CreatedAsc,
        SortOrder::CreatedDesc,
        SortOrder::UpdatedAsc,
        SortOrder::UpdatedDesc,
        SortOrder::TitleAsc,
        SortOrder::TitleDesc,
    ];

    /// Value of the `ordering` query parameter.
    pub fn as_param(&self) -> &'static str {
        match self {
            SortOrder::CreatedAsc => "created",
            SortOrder::CreatedDesc => "-created",
            SortOrder::UpdatedAsc => "update",
            SortOrder::UpdatedDesc => "-update",
            SortOrder::TitleAsc => "title",
            SortOrder::TitleDesc => "-title",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_param())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown ordering {0:?} (expected one of created, -created, update, -update, title, -title)")]
pub struct UnknownOrdering(String);

impl FromStr for SortOrder {
    type Err = UnknownOrdering;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortOrder::ALL
            .into_iter()
            .find(|order| order.as_param() == s)
            .ok_or_else(|| UnknownOrdering(s.to_string()))
    }
}

impl TryFrom<String> for SortOrder {
    type Error = UnknownOrdering;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SortOrder> for String {
    fn from(order: SortOrder) -> Self {
        order.as_param().to_string()
    }
}

/// Parameters for listing the remote collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub ordering: SortOrder,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub updated_from: Option<DateTime<Utc>>,
    pub updated_to: Option<DateTime<Utc>>,
}

impl ListQuery {
    pub fn new(ordering: SortOrder) -> Self {
        Self {
            ordering,
            ..Default::default()
        }
    }

    /// Restrict to items created within `[from, to]`; either bound may be open.
    pub fn created_between(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_from = from;
        self.created_to = to;
        self
    }

    /// Restrict to items updated within `[from, to]`; either bound may be open.
    pub fn updated_between(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.updated_from = from;
        self.updated_to = to;
        self
    }

    /// Query-string pairs, `ordering` first.
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("ordering", self.ordering.as_param().to_string())];
        let bounds = [
            ("created_from", self.created_from),
            ("created_to", self.created_to),
            ("updated_from", self.updated_from),
            ("updated_to", self.updated_to),
        ];
        for (name, bound) in bounds {
            if let Some(at) = bound {
                params.push((name, at.to_rfc3339()));
            }
        }
        params
    }
}
