use std::fmt::Debug;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::prelude::FromRow;

use super::{Entity, EntityUpdate, SqlTime, SqlValue};
use crate::entity::Feed;
use crate::parse::{ParsedFeed, ParsedItem};
use crate::quirks;

/// One entry inside a feed document, deduplicated per feed by a derived key.
///
/// The description is stored but never serialised; clients fetch summaries
/// only and payload sizes matter at a few thousand unread items.
#[derive(Serialize, FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    id: i64,
    #[sqlx(rename = "feedid")]
    pub feed_id: i64,
    #[serde(skip)]
    pub key: String,
    pub title: String,
    pub url: String,
    #[serde(skip)]
    #[sqlx(rename = "content")]
    pub description: String,
    pub timestamp: SqlTime,
    pub read: bool,
    #[serde(serialize_with = "SqlTime::unix_seconds")]
    pub commit_timestamp: SqlTime,
}

impl Entity for Item {
    const TABLE: &'static str = "items";
    const SELECT: &'static str = "SELECT items.* FROM items";

    fn id(&self) -> i64 {
        self.id
    }
}

const ITEM_UPDATE_SQL: &str = "\
UPDATE items SET
    read = ?,
    commit_timestamp = CURRENT_TIMESTAMP
WHERE id = ?";

/// Marks an item read or unread. No-op when already in the desired state.
pub fn set_read(read: bool) -> impl Fn(&Item) -> EntityUpdate {
    move |item| {
        if item.read == read {
            return EntityUpdate::noop(Item::TABLE);
        }
        EntityUpdate::write(
            Item::TABLE,
            ITEM_UPDATE_SQL,
            vec![SqlValue::Bool(read), SqlValue::Int(item.id)],
        )
    }
}

/// An item as constructed from a parsed document, before it has a row id.
/// Inserted with `INSERT OR IGNORE` and discarded.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub feed_id: i64,
    pub key: String,
    pub title: String,
    pub url: String,
    pub description: String,
    pub timestamp: SqlTime,
}

/// Builds the insert batch for one parsed document.
///
/// Items are emitted oldest-first: when a feed omits timestamps and they all
/// default to now, ascending row ids still reproduce publication order, and
/// the `timestamp DESC, id DESC` client ordering ties break correctly.
pub fn build_items(feed: &Feed, parsed: &ParsedFeed) -> Vec<NewItem> {
    let now = SqlTime::now();
    let suffix_keys = quirks::key_includes_timestamp(&feed.url);

    parsed
        .items
        .iter()
        .rev()
        .map(|entry| {
            let timestamp = entry.published.or(entry.updated).map_or(now, Into::into);
            let mut key = derive_key(entry);
            if suffix_keys {
                // Republished entries keep their id but change the date;
                // fold the date into the key so they surface as new.
                key.push_str(&timestamp.to_string());
            }

            NewItem {
                feed_id: feed.id(),
                key,
                title: entry.title.clone(),
                url: quirks::rewrite_item_url(feed, entry),
                description: entry.description.clone().unwrap_or_default(),
                timestamp,
            }
        })
        .collect()
}

// Many real-world feeds omit stable identifiers, so fall back from the
// document id to title+published, and finally to a digest of the body.
fn derive_key(entry: &ParsedItem) -> String {
    if let Some(guid) = entry.guid.as_deref() {
        if !guid.is_empty() {
            return guid.to_owned();
        }
    }

    if !entry.title.is_empty() {
        if let Some(published) = &entry.published_text {
            if !published.is_empty() {
                return format!("{}{}", entry.title, published);
            }
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(entry.description.as_deref().unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

impl Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[Item {} - feed {}: {} ({}), {:?}",
            self.id, self.feed_id, self.url, self.title, self.timestamp,
        )?;
        if self.read {
            f.write_str(" read")?;
        }
        f.write_str("]")
    }
}
