use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use super::{Entity, EntityUpdate, SqlTime, SqlValue};
use crate::parse::ParsedFeed;
use crate::quirks;

/// A feed source: an http(s) URL, or a shell command when the url begins
/// with `!`. Feeds are never deleted, only disabled.
#[derive(Serialize, FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    id: i64,
    pub url: String,
    pub disabled: bool,
    pub title: String,
    #[sqlx(rename = "siteurl")]
    pub site_url: String,
    #[sqlx(rename = "usertitle")]
    pub user_title: String,
    #[sqlx(rename = "categoryid")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
    /// Set on the first failed poll after a success, cleared by the next
    /// successful poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_since: Option<SqlTime>,
    #[serde(serialize_with = "SqlTime::unix_seconds")]
    pub commit_timestamp: SqlTime,
    #[serde(serialize_with = "SqlTime::unix_seconds")]
    pub create_timestamp: SqlTime,
}

impl Entity for Feed {
    const TABLE: &'static str = "feeds";

    // categoryid is read through a subquery so feeds pointing at a disabled
    // category transparently lose the association.
    const SELECT: &'static str = "\
SELECT
    feeds.id,
    feeds.url,
    feeds.disabled,
    feeds.title,
    feeds.siteurl,
    feeds.usertitle,
    (SELECT categories.id FROM categories
        WHERE categories.id = feeds.categoryid AND categories.disabled = 0) AS categoryid,
    feeds.failing_since,
    feeds.commit_timestamp,
    feeds.create_timestamp
FROM feeds";

    fn id(&self) -> i64 {
        self.id
    }
}

const FEED_UPDATE_SQL: &str = "\
UPDATE feeds SET
    disabled = ?,
    title = ?,
    siteurl = ?,
    usertitle = ?,
    categoryid = ?,
    failing_since = ?,
    commit_timestamp = CURRENT_TIMESTAMP
WHERE id = ?";

impl Feed {
    fn update(&self) -> EntityUpdate {
        EntityUpdate::write(
            Self::TABLE,
            FEED_UPDATE_SQL,
            vec![
                SqlValue::Bool(self.disabled),
                SqlValue::Text(self.title.clone()),
                SqlValue::Text(self.site_url.clone()),
                SqlValue::Text(self.user_title.clone()),
                SqlValue::opt_int(self.category_id),
                SqlValue::opt_time(self.failing_since),
                SqlValue::Int(self.id),
            ],
        )
    }
}

/// The fields a user is allowed to change on a feed.
#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FeedEdit {
    pub category_id: Option<i64>,
    #[serde(default)]
    pub clear_category: bool,
    pub disabled: Option<bool>,
    pub user_title: Option<String>,
}

/// Merges the title and site link from a freshly parsed document, after
/// quirks normalisation. Never clears an existing site URL; falls back to
/// the feed URL when a feed omits its link entirely.
pub fn merge_parsed(parsed: &ParsedFeed) -> impl Fn(&Feed) -> EntityUpdate + '_ {
    move |feed| {
        let mut next = feed.clone();
        next.title = quirks::rewrite_title(feed, parsed);

        match quirks::rewrite_link(feed, parsed) {
            Some(link) if !link.is_empty() => next.site_url = link,
            _ => {
                if next.site_url.is_empty() && !next.url.starts_with('!') {
                    tracing::warn!(feed = %feed, "feed document carries no site link");
                    next.site_url = next.url.clone();
                }
            }
        }

        if next.title == feed.title && next.site_url == feed.site_url {
            return EntityUpdate::noop(Feed::TABLE);
        }
        next.update()
    }
}

/// Records the start of an outage. No-op while an earlier failure is still
/// unresolved, so `failing_since` keeps the time of the first failure.
pub fn set_fetch_failed(now: SqlTime) -> impl Fn(&Feed) -> EntityUpdate {
    move |feed| {
        if feed.failing_since.is_some() {
            return EntityUpdate::noop(Feed::TABLE);
        }
        let mut next = feed.clone();
        next.failing_since = Some(now);
        next.update()
    }
}

/// Clears `failing_since` after a successful poll.
pub fn set_fetch_success(feed: &Feed) -> EntityUpdate {
    if feed.failing_since.is_none() {
        return EntityUpdate::noop(Feed::TABLE);
    }
    let mut next = feed.clone();
    next.failing_since = None;
    next.update()
}

/// Applies a user edit. No-op when no field actually changes.
pub fn apply_edit(edit: FeedEdit) -> impl FnOnce(&Feed) -> EntityUpdate {
    move |feed| {
        let mut next = feed.clone();

        if let Some(category) = edit.category_id {
            next.category_id = Some(category);
        } else if edit.clear_category {
            next.category_id = None;
        }
        if let Some(disabled) = edit.disabled {
            next.disabled = disabled;
        }
        if let Some(user_title) = edit.user_title {
            next.user_title = user_title;
        }

        if next.category_id == feed.category_id
            && next.disabled == feed.disabled
            && next.user_title == feed.user_title
        {
            return EntityUpdate::noop(Feed::TABLE);
        }
        next.update()
    }
}

#[cfg(test)]
impl Feed {
    /// Bare feed for unit tests; real feeds only come out of the store.
    pub(crate) fn stub(url: &str) -> Self {
        Self {
            id: 1,
            url: url.to_owned(),
            disabled: false,
            title: String::new(),
            site_url: String::new(),
            user_title: String::new(),
            category_id: None,
            failing_since: None,
            commit_timestamp: SqlTime::now(),
            create_timestamp: SqlTime::now(),
        }
    }
}

impl Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Compact, this gets logged on every worker iteration
        write!(f, "[Feed {}: {}", self.id, self.url)?;
        if self.disabled {
            f.write_str(" disabled")?;
        }
        if let Some(since) = self.failing_since {
            write!(f, ", failing since {since:?}")?;
        }
        f.write_str("]")
    }
}

impl std::fmt::Display for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
