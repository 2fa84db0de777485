use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use super::db::{execute_update, get_in_tx, Store, StoreError};
use crate::entity::{item, Entity, Feed, Item, SqlTime};

const DEFAULT_READ_BEFORE_COUNT: u32 = 100;

/// A batch item query: one selector (all enabled feeds, one category, or an
/// explicit feed list) combined with one temporal window.
///
/// The wire shape is a bag of optional fields; it is validated into the
/// tagged form before any SQL is built so the mutually exclusive groups
/// cannot silently combine.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GetItemsRequest {
    pub category_id: Option<i64>,
    #[serde(default)]
    pub feed_ids: Vec<i64>,
    #[serde(default)]
    pub unread: bool,
    /// All read items at or after this instant. Used when the client
    /// backfills a category that gained a feed.
    pub read_after: Option<DateTime<Utc>>,
    /// At least `read_before_count` read items strictly before this
    /// instant; everything sharing the window's oldest second is included
    /// so no gap can form between pages.
    pub read_before: Option<DateTime<Utc>>,
    pub read_before_count: Option<NonZeroU32>,
    /// Also return the feed records for the requested ids.
    #[serde(default)]
    pub include_feeds: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GetItemsResponse {
    pub items: Vec<Item>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feeds: Option<Vec<Feed>>,
}

enum Selector {
    AllEnabled,
    Category(i64),
    Feeds(Vec<i64>),
}

enum Window {
    Unread,
    ReadAfter { after: SqlTime, with_unread: bool },
    ReadBefore { before: SqlTime, count: u32 },
}

impl GetItemsRequest {
    fn validate(self) -> Result<(Selector, Window, bool), StoreError> {
        let invalid = |msg: &str| Err(StoreError::Invalid(msg.into()));

        if self.category_id.is_some() && !self.feed_ids.is_empty() {
            return invalid("cannot query by both categoryId and feedIds");
        }
        if self.read_after.is_some() && self.read_before.is_some() {
            return invalid("cannot query by both readAfter and readBefore");
        }
        if self.unread && self.read_before.is_some() {
            return invalid("cannot query both unread and readBefore");
        }
        if self.read_before_count.is_some() && self.read_before.is_none() {
            return invalid("readBeforeCount requires readBefore");
        }
        if self.include_feeds && self.feed_ids.is_empty() {
            return invalid("includeFeeds requires explicit feedIds");
        }

        let selector = if let Some(category) = self.category_id {
            Selector::Category(category)
        } else if !self.feed_ids.is_empty() {
            Selector::Feeds(self.feed_ids.clone())
        } else {
            Selector::AllEnabled
        };

        let window = if let Some(before) = self.read_before {
            Window::ReadBefore {
                before: before.into(),
                count: self
                    .read_before_count
                    .map_or(DEFAULT_READ_BEFORE_COUNT, NonZeroU32::get),
            }
        } else if let Some(after) = self.read_after {
            Window::ReadAfter { after: after.into(), with_unread: self.unread }
        } else if self.unread {
            if self.feed_ids.is_empty() {
                return invalid("unread items can only be requested by feedIds");
            }
            Window::Unread
        } else {
            return invalid("empty items request");
        };

        Ok((selector, window, self.include_feeds))
    }
}

fn push_selector(builder: &mut QueryBuilder<'_, Sqlite>, selector: &Selector) {
    match selector {
        Selector::Category(category) => {
            builder.push(" feeds.categoryid = ").push_bind(*category);
        }
        Selector::Feeds(ids) => {
            builder.push(" feeds.id IN (");
            let mut sep = builder.separated(", ");
            for id in ids {
                sep.push_bind(*id);
            }
            builder.push(") ");
        }
        Selector::AllEnabled => {
            builder.push(" feeds.disabled = 0 ");
        }
    }
}

impl Store {
    /// Runs a validated batch item query in one read transaction.
    pub async fn get_items(&self, req: GetItemsRequest) -> Result<GetItemsResponse, StoreError> {
        let (selector, window, include_feeds) = req.validate()?;

        let inner = self.read().await?;
        let mut tx = inner.pool.begin().await?;

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT items.* FROM feeds INNER JOIN items ON items.feedid = feeds.id WHERE ",
        );
        push_selector(&mut builder, &selector);

        match &window {
            Window::Unread => {
                builder.push(" AND items.read = 0 ");
            }
            Window::ReadAfter { after, with_unread } => {
                if *with_unread {
                    builder
                        .push(" AND (items.read = 0 OR items.timestamp >= ")
                        .push_bind(*after)
                        .push(") ");
                } else {
                    builder
                        .push(" AND items.read = 1 AND items.timestamp >= ")
                        .push_bind(*after);
                }
            }
            Window::ReadBefore { before, count } => {
                // At least `count` items, extended to everything sharing
                // the oldest selected second, so items that tie on
                // timestamp can never straddle a page boundary.
                builder
                    .push(" AND items.read = 1 AND items.timestamp < ")
                    .push_bind(*before)
                    .push(
                        " AND items.timestamp >= (
    SELECT MIN(timestamp) FROM (
        SELECT items.timestamp
        FROM feeds INNER JOIN items ON items.feedid = feeds.id
        WHERE ",
                    );
                push_selector(&mut builder, &selector);
                builder
                    .push(" AND items.read = 1 AND items.timestamp < ")
                    .push_bind(*before)
                    .push(" ORDER BY items.timestamp DESC LIMIT ")
                    .push_bind(i64::from(*count))
                    .push(")) ");
            }
        }

        builder.push(" ORDER BY items.id ASC");
        let items: Vec<Item> = builder.build_query_as().fetch_all(&mut *tx).await?;

        let feeds = if include_feeds {
            let Selector::Feeds(ids) = &selector else { unreachable!() };
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!("{} WHERE feeds.id IN (", Feed::SELECT));
            let mut sep = builder.separated(", ");
            for id in ids {
                sep.push_bind(*id);
            }
            builder.push(") ORDER BY feeds.id ASC");
            Some(builder.build_query_as().fetch_all(&mut *tx).await?)
        } else {
            None
        };

        tx.commit().await?;
        Ok(GetItemsResponse { items, feeds })
    }

    /// Marks every unread item of `feed_id` with `id <= max_id` as read,
    /// atomically, and returns the post-state of the affected items ordered
    /// by id. Items inserted concurrently are untouched: the affected set
    /// is fixed by the read at the start of the transaction.
    pub async fn mark_feed_read(
        &self,
        feed_id: i64,
        max_id: i64,
    ) -> Result<Vec<Item>, StoreError> {
        let inner = self.write().await?;
        let mut tx = inner.pool.begin().await?;

        let unread: Vec<Item> = sqlx::query_as(&format!(
            "{} WHERE items.feedid = ? AND items.read = 0 AND items.id <= ? \
             ORDER BY items.id ASC",
            Item::SELECT
        ))
        .bind(feed_id)
        .bind(max_id)
        .fetch_all(&mut *tx)
        .await?;

        let mark_read = item::set_read(true);
        let mut marked = Vec::with_capacity(unread.len());
        for item in &unread {
            let update = mark_read(item);
            debug_assert!(!update.is_noop());
            execute_update(&mut tx, &update).await?;
            marked.push(get_in_tx::<Item>(&mut tx, item.id()).await?);
        }

        tx.commit().await?;
        tracing::debug!(feed_id, max_id, marked = marked.len(), "marked feed read");
        Ok(marked)
    }
}
