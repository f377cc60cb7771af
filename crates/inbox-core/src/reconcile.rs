//! Turning a raw server snapshot into the list a given identity should see.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::item::Item;

/// Which non-privileged items an identity may see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Items whose `owner` is the subject (messages).
    #[default]
    Owner,
    /// Active items listing the subject among their members (projects).
    Membership,
}

/// Whether `identity` may see `item` under `rule`.
pub fn is_visible(item: &Item, identity: &Identity, rule: Visibility) -> bool {
    if identity.is_privileged {
        return true;
    }
    match rule {
        Visibility::Owner => item.is_owned_by(&identity.subject_id),
        Visibility::Membership => item.is_active() && item.has_member(&identity.subject_id),
    }
}

/// Filters a snapshot to what `identity` may see and orders it newest first.
///
/// The sort is stable: items with equal `created` keep their server order.
pub fn reconcile(items: Vec<Item>, identity: &Identity, rule: Visibility) -> Vec<Item> {
    let mut visible: Vec<Item> = items
        .into_iter()
        .filter(|item| is_visible(item, identity, rule))
        .collect();
    visible.sort_by(|a, b| b.created.cmp(&a.created));
    visible
}
