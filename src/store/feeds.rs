use super::db::{Store, StoreError};
use crate::entity::{Entity, Feed};

impl Store {
    /// The set of enabled feeds, ordered by id. This is what the fetch
    /// engine reconciles its fleet against.
    pub async fn current_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let inner = self.read().await?;
        let feeds = sqlx::query_as(&format!(
            "{} WHERE feeds.disabled = 0 ORDER BY feeds.id ASC",
            Feed::SELECT
        ))
        .fetch_all(&inner.pool)
        .await?;
        Ok(feeds)
    }

    /// Disabled feeds for the admin surface. No pagination; the number of
    /// feeds one user disables stays small.
    pub async fn disabled_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let inner = self.read().await?;
        let feeds = sqlx::query_as(&format!(
            "{} WHERE feeds.disabled = 1 ORDER BY feeds.id ASC",
            Feed::SELECT
        ))
        .fetch_all(&inner.pool)
        .await?;
        Ok(feeds)
    }

    /// Creates a feed from a URL (or `!`-prefixed command) and optional
    /// user title. The URL is unique; inserting a duplicate is an error.
    pub async fn insert_feed(&self, url: &str, user_title: &str) -> Result<Feed, StoreError> {
        if url.is_empty() {
            return Err(StoreError::Invalid("feed url cannot be empty".into()));
        }

        let inner = self.write().await?;
        tracing::info!(url, "adding feed");

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO feeds(url, usertitle) VALUES (?, ?) RETURNING id",
        )
        .bind(url)
        .bind(user_title)
        .fetch_one(&inner.pool)
        .await?;

        let feed = sqlx::query_as(&format!("{} WHERE feeds.id = ?", Feed::SELECT))
            .bind(id)
            .fetch_one(&inner.pool)
            .await?;
        Ok(feed)
    }
}
