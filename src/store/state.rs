use std::collections::HashMap;

use serde::Serialize;

use super::db::{tx_timestamp, Store, StoreError};
use crate::entity::{Category, Entity, Feed, Item, SqlTime};

/// The window past which an incremental catch-up is refused and the client
/// is told to refetch the snapshot instead.
const MAX_CLIENT_STALENESS_SECS: i64 = 60 * 60 * 24 * 7;

/// The initial payload sent to a client: everything it needs to render,
/// plus the timestamp to poll `updates_since` with.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub feeds: Vec<Feed>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<Category>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,
    /// Publication time of the newest item per enabled feed.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub newest_timestamps: HashMap<i64, SqlTime>,
}

/// Every entity written after the client's last poll, or `must_refresh`
/// when the client has been gone too long to catch up incrementally.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Updates {
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub feeds: Vec<Feed>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<Category>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,
    pub must_refresh: bool,
}

impl Store {
    /// Full snapshot from a single read transaction, so the caller gets one
    /// consistent cut of feeds, categories, unread items, and per-feed
    /// newest timestamps.
    pub async fn current_state(&self) -> Result<CurrentState, StoreError> {
        let inner = self.read().await?;
        let mut tx = inner.pool.begin().await?;

        let timestamp = tx_timestamp(&mut tx).await?;

        let feeds: Vec<Feed> = sqlx::query_as(&format!(
            "{} WHERE feeds.disabled = 0 ORDER BY feeds.id ASC",
            Feed::SELECT
        ))
        .fetch_all(&mut *tx)
        .await?;

        let categories: Vec<Category> = sqlx::query_as(&format!(
            "{} WHERE categories.disabled = 0 ORDER BY categories.id ASC",
            Category::SELECT
        ))
        .fetch_all(&mut *tx)
        .await?;

        let items: Vec<Item> = sqlx::query_as(
            "SELECT items.* FROM feeds INNER JOIN items ON items.feedid = feeds.id
             WHERE feeds.disabled = 0 AND items.read = 0
             ORDER BY items.id ASC",
        )
        .fetch_all(&mut *tx)
        .await?;

        let newest: Vec<(i64, SqlTime)> = sqlx::query_as(
            "SELECT items.feedid, MAX(items.timestamp)
             FROM items INNER JOIN feeds ON feeds.id = items.feedid
             WHERE feeds.disabled = 0
             GROUP BY items.feedid",
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CurrentState {
            timestamp,
            feeds,
            categories,
            items,
            newest_timestamps: newest.into_iter().collect(),
        })
    }

    /// Everything with `commit_timestamp > since` (Unix seconds), from one
    /// read transaction. The strict inequality pairs with clients
    /// persisting `timestamp` from the previous response, which is already
    /// one second in the past: no committed change can fall between polls.
    pub async fn updates_since(&self, since: i64) -> Result<Updates, StoreError> {
        let inner = self.read().await?;
        let mut tx = inner.pool.begin().await?;

        let timestamp = tx_timestamp(&mut tx).await?;

        if since + MAX_CLIENT_STALENESS_SECS < timestamp {
            tx.commit().await?;
            return Ok(Updates {
                timestamp,
                feeds: Vec::new(),
                categories: Vec::new(),
                items: Vec::new(),
                must_refresh: true,
            });
        }

        let since = SqlTime(
            chrono::DateTime::from_timestamp(since, 0)
                .ok_or_else(|| StoreError::Invalid(format!("timestamp {since} out of range")))?,
        );

        let feeds = updated::<Feed>(&mut tx, since).await?;
        let categories = updated::<Category>(&mut tx, since).await?;
        let items = updated::<Item>(&mut tx, since).await?;

        tx.commit().await?;

        Ok(Updates { timestamp, feeds, categories, items, must_refresh: false })
    }
}

// The commit index keeps this O(changed) instead of O(table).
async fn updated<T: Entity>(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    since: SqlTime,
) -> Result<Vec<T>, StoreError> {
    let rows = sqlx::query_as(&format!(
        "{select} INDEXED BY {table}_commit_index
         WHERE {table}.commit_timestamp > ?
         ORDER BY {table}.id ASC",
        select = T::SELECT,
        table = T::TABLE,
    ))
    .bind(since)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}
