//! Integration tests for the store: migrations, the changefeed contract,
//! batch item queries, and entity mutation semantics.
//!
//! Each test opens its own in-memory database. Tests that exercise the
//! changefeed sleep across a wall-clock second boundary because commit
//! timestamps have second precision.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tributary::entity::{category, feed, item, CategoryAdd, CategoryEdit, Entity, Feed, FeedEdit, Item, NewItem, SqlTime};
use tributary::store::{GetItemsRequest, Store};

async fn test_store() -> Store {
    Store::open(":memory:", false).await.unwrap()
}

fn new_item(feed: &Feed, key: &str, timestamp: SqlTime) -> NewItem {
    NewItem {
        feed_id: feed.id(),
        key: key.to_owned(),
        title: format!("Item {key}"),
        url: format!("https://example.com/{key}"),
        description: format!("description of {key}"),
        timestamp,
    }
}

fn at(seconds: i64) -> SqlTime {
    SqlTime(Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap())
}

async fn unread_items(store: &Store, feed: &Feed) -> Vec<Item> {
    store
        .get_items(GetItemsRequest {
            feed_ids: vec![feed.id()],
            unread: true,
            ..GetItemsRequest::default()
        })
        .await
        .unwrap()
        .items
}

// ============================================================================
// Migrations
// ============================================================================

#[tokio::test]
async fn fresh_database_reaches_latest_version() {
    let store = test_store().await;
    assert_eq!(store.schema_version().await.unwrap(), 6);
}

#[tokio::test]
async fn reopening_is_a_noop() {
    // Two stores on distinct in-memory databases cannot share state, so
    // use a real file to prove reopening converges.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.db");
    let path = path.to_str().unwrap();

    {
        let store = Store::open(path, false).await.unwrap();
        store.insert_feed("https://example.com/rss", "").await.unwrap();
        store.close().await;
    }

    let store = Store::open(path, false).await.unwrap();
    assert_eq!(store.schema_version().await.unwrap(), 6);
    assert_eq!(store.current_feeds().await.unwrap().len(), 1);
}

// ============================================================================
// Feeds
// ============================================================================

#[tokio::test]
async fn insert_feed_assigns_ids_monotonically() {
    let store = test_store().await;
    let first = store.insert_feed("https://example.com/a", "").await.unwrap();
    let second = store.insert_feed("https://example.com/b", "Named").await.unwrap();
    assert!(second.id() > first.id());
    assert_eq!(second.user_title, "Named");
    assert!(second.failing_since.is_none());
}

#[tokio::test]
async fn duplicate_feed_urls_are_rejected() {
    let store = test_store().await;
    store.insert_feed("https://example.com/rss", "").await.unwrap();
    assert!(store.insert_feed("https://example.com/rss", "").await.is_err());
}

#[tokio::test]
async fn disabling_moves_feed_between_listings() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();

    let edit = FeedEdit { disabled: Some(true), ..FeedEdit::default() };
    let apply = feed::apply_edit(edit);
    let disabled: Feed = store.mutate(feed.id(), |f: &Feed| Ok(apply(f))).await.unwrap();
    assert!(disabled.disabled);

    let state = store.current_state().await.unwrap();
    assert!(state.feeds.is_empty());

    let listed = store.disabled_feeds().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id(), feed.id());
}

#[tokio::test]
async fn failing_since_follows_fetch_outcomes() {
    let store = test_store().await;
    let f = store.insert_feed("https://example.com/rss", "").await.unwrap();

    let now = SqlTime::now();
    let fail = feed::set_fetch_failed(now);
    let failing: Feed = store.mutate(f.id(), |f: &Feed| Ok(fail(f))).await.unwrap();
    assert!(failing.failing_since.is_some());

    // A later failure does not move the marker
    let later = feed::set_fetch_failed(SqlTime(Utc::now() + ChronoDuration::seconds(60)));
    let still: Feed = store.mutate(f.id(), |f: &Feed| Ok(later(f))).await.unwrap();
    assert_eq!(still.failing_since.map(|t| t.unix()), failing.failing_since.map(|t| t.unix()));

    let cleared: Feed =
        store.mutate(f.id(), |f: &Feed| Ok(feed::set_fetch_success(f))).await.unwrap();
    assert!(cleared.failing_since.is_none());
}

// ============================================================================
// Items
// ============================================================================

#[tokio::test]
async fn insert_items_is_idempotent_per_feed_key() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();

    let batch = vec![
        new_item(&feed, "a", at(0)),
        new_item(&feed, "b", at(1)),
        new_item(&feed, "c", at(2)),
    ];
    assert_eq!(store.insert_items(&batch).await.unwrap(), 3);

    // Same batch again plus one new key
    let mut again = batch.clone();
    again.push(new_item(&feed, "d", at(3)));
    assert_eq!(store.insert_items(&again).await.unwrap(), 1);

    let items = unread_items(&store, &feed).await;
    assert_eq!(items.len(), 4);

    // Ascending ids track ascending insertion order
    for pair in items.windows(2) {
        assert!(pair[0].id() < pair[1].id());
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn same_key_on_another_feed_is_a_distinct_item() {
    let store = test_store().await;
    let one = store.insert_feed("https://example.com/one", "").await.unwrap();
    let two = store.insert_feed("https://example.com/two", "").await.unwrap();

    assert_eq!(store.insert_items(&[new_item(&one, "shared", at(0))]).await.unwrap(), 1);
    assert_eq!(store.insert_items(&[new_item(&two, "shared", at(0))]).await.unwrap(), 1);
}

#[tokio::test]
async fn dedupe_marks_cross_feed_urls_read() {
    let store = Store::open(":memory:", true).await.unwrap();
    let one = store.insert_feed("https://example.com/one", "").await.unwrap();
    let two = store.insert_feed("https://example.com/two", "").await.unwrap();

    let mut original = new_item(&one, "o", at(0));
    original.url = "https://example.com/post".to_owned();
    store.insert_items(&[original]).await.unwrap();

    let mut duplicate = new_item(&two, "d", at(1));
    duplicate.url = "https://example.com/post".to_owned();
    store.insert_items(&[duplicate]).await.unwrap();

    assert_eq!(unread_items(&store, &one).await.len(), 1);
    // The cross-feed duplicate entered the store already read
    assert!(unread_items(&store, &two).await.is_empty());
}

#[tokio::test]
async fn mark_feed_read_stops_at_max_id() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    store
        .insert_items(&[
            new_item(&feed, "a", at(0)),
            new_item(&feed, "b", at(1)),
            new_item(&feed, "c", at(2)),
        ])
        .await
        .unwrap();

    let items = unread_items(&store, &feed).await;
    let middle_id = items[1].id();

    let marked = store.mark_feed_read(feed.id(), middle_id).await.unwrap();
    assert_eq!(marked.len(), 2);
    assert!(marked.iter().all(|i| i.read));
    assert!(marked.windows(2).all(|p| p[0].id() < p[1].id()));

    // Marking again affects nothing; the remaining item is still unread
    assert!(store.mark_feed_read(feed.id(), middle_id).await.unwrap().is_empty());
    assert_eq!(unread_items(&store, &feed).await.len(), 1);
}

#[tokio::test]
async fn item_read_mutator_round_trips() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    store.insert_items(&[new_item(&feed, "a", at(0))]).await.unwrap();
    let id = unread_items(&store, &feed).await[0].id();

    let mark = item::set_read(true);
    let read: Item = store.mutate(id, |i: &Item| Ok(mark(i))).await.unwrap();
    assert!(read.read);

    let unmark = item::set_read(false);
    let unread: Item = store.mutate(id, |i: &Item| Ok(unmark(i))).await.unwrap();
    assert!(!unread.read);
}

#[tokio::test]
async fn noop_mutation_does_not_advance_commit_timestamp() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    store.insert_items(&[new_item(&feed, "a", at(0))]).await.unwrap();
    let item = unread_items(&store, &feed).await.remove(0);

    // Wait out the second so a real write would be observable
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let unmark = item::set_read(false);
    let after: Item = store.mutate(item.id(), |i: &Item| Ok(unmark(i))).await.unwrap();
    assert_eq!(after.commit_timestamp.unix(), item.commit_timestamp.unix());
}

#[tokio::test]
async fn concurrent_mutations_serialise_without_lost_writes() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    store.insert_items(&[new_item(&feed, "a", at(0))]).await.unwrap();
    let id = unread_items(&store, &feed).await[0].id();

    // Many racing read/unread flips; the write gate serialises them, so
    // every one observes a consistent row and none is lost.
    let mut tasks = tokio::task::JoinSet::new();
    for flip in 0..20 {
        let store = store.clone();
        tasks.spawn(async move {
            let mark = item::set_read(flip % 2 == 0);
            store.mutate::<Item, _>(id, |i| Ok(mark(i))).await.unwrap()
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    // The final state matches whichever mutator ran last
    let last: Item = store.get(id).await.unwrap();
    let redo = item::set_read(last.read);
    let same: Item = store.mutate(id, |i: &Item| Ok(redo(i))).await.unwrap();
    assert_eq!(same.read, last.read);
    assert_eq!(same.commit_timestamp.unix(), last.commit_timestamp.unix());
}

#[tokio::test]
async fn mutating_a_missing_row_reports_not_found() {
    let store = test_store().await;
    let mark = item::set_read(true);
    let result = store.mutate(999, |i: &Item| Ok(mark(i))).await;
    assert!(result.unwrap_err().is_missing_row());
}

// ============================================================================
// Batch item queries
// ============================================================================

#[tokio::test]
async fn get_items_rejects_conflicting_selectors() {
    let store = test_store().await;

    for req in [
        GetItemsRequest {
            category_id: Some(1),
            feed_ids: vec![1],
            unread: true,
            ..GetItemsRequest::default()
        },
        GetItemsRequest {
            feed_ids: vec![1],
            read_after: Some(Utc::now()),
            read_before: Some(Utc::now()),
            ..GetItemsRequest::default()
        },
        // Unread needs explicit feeds
        GetItemsRequest { unread: true, ..GetItemsRequest::default() },
        // Empty request
        GetItemsRequest::default(),
    ] {
        assert!(store.get_items(req).await.is_err());
    }
}

#[tokio::test]
async fn get_items_by_category() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    let other = store.insert_feed("https://example.com/other", "").await.unwrap();
    store
        .insert_items(&[new_item(&feed, "a", at(0)), new_item(&other, "b", at(0))])
        .await
        .unwrap();

    let cat = store
        .insert_category(&CategoryAdd {
            name: "news".into(),
            title: "News".into(),
            hidden_nav: false,
            hidden_main: false,
        })
        .await
        .unwrap();

    let assign = feed::apply_edit(FeedEdit {
        category_id: Some(cat.id()),
        ..FeedEdit::default()
    });
    store.mutate::<Feed, _>(feed.id(), |f| Ok(assign(f))).await.unwrap();

    // Unread in the category: read state does not matter for the selector,
    // only membership does.
    let read_after_epoch = GetItemsRequest {
        category_id: Some(cat.id()),
        unread: true,
        read_after: Some(Utc.timestamp_opt(0, 0).unwrap()),
        ..GetItemsRequest::default()
    };
    let response = store.get_items(read_after_epoch).await.unwrap();
    assert_eq!(response.items.len(), 1);
    assert_eq!(response.items[0].feed_id, feed.id());
}

#[tokio::test]
async fn read_before_window_includes_timestamp_ties() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();

    // Two items share the oldest second
    store
        .insert_items(&[
            new_item(&feed, "tie1", at(0)),
            new_item(&feed, "tie2", at(0)),
            new_item(&feed, "mid", at(60)),
            new_item(&feed, "new", at(120)),
        ])
        .await
        .unwrap();
    let max_id = unread_items(&store, &feed).await.last().unwrap().id();
    store.mark_feed_read(feed.id(), max_id).await.unwrap();

    let request = |count| GetItemsRequest {
        feed_ids: vec![feed.id()],
        read_before: Some(at(3600).0),
        read_before_count: std::num::NonZeroU32::new(count),
        ..GetItemsRequest::default()
    };

    // Two most recent read items
    let two = store.get_items(request(2)).await.unwrap();
    assert_eq!(two.items.len(), 2);

    // Asking for three pulls in the tied pair as well: no gap may form
    // inside a shared second
    let three = store.get_items(request(3)).await.unwrap();
    assert_eq!(three.items.len(), 4);
}

#[tokio::test]
async fn include_feeds_returns_feed_records() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    store.insert_items(&[new_item(&feed, "a", at(0))]).await.unwrap();

    let response = store
        .get_items(GetItemsRequest {
            feed_ids: vec![feed.id()],
            unread: true,
            include_feeds: true,
            ..GetItemsRequest::default()
        })
        .await
        .unwrap();

    let feeds = response.feeds.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].id(), feed.id());
}

// ============================================================================
// Snapshot and changefeed
// ============================================================================

#[tokio::test]
async fn snapshot_covers_enabled_unread_world() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    store
        .insert_items(&[new_item(&feed, "a", at(0)), new_item(&feed, "b", at(60))])
        .await
        .unwrap();
    let first_id = unread_items(&store, &feed).await[0].id();
    store.mark_feed_read(feed.id(), first_id).await.unwrap();

    let state = store.current_state().await.unwrap();
    assert_eq!(state.feeds.len(), 1);
    // Only unread items are in the snapshot
    assert_eq!(state.items.len(), 1);
    // Newest timestamp covers all items, read or not
    assert_eq!(state.newest_timestamps[&feed.id()].unix(), at(60).unix());
    assert!(state.timestamp > 0);
}

#[tokio::test]
async fn updates_since_returns_exactly_the_changed_rows() {
    let store = test_store().await;
    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();

    // Move to a fresh second so the feed insert is strictly older than the
    // snapshot timestamp
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let snapshot = store.current_state().await.unwrap();

    store.insert_items(&[new_item(&feed, "a", at(0))]).await.unwrap();

    let updates = store.updates_since(snapshot.timestamp).await.unwrap();
    assert!(!updates.must_refresh);
    assert_eq!(updates.items.len(), 1);
    assert!(updates.feeds.is_empty());
    assert!(updates.categories.is_empty());

    // Polling again from the returned timestamp converges: the item stays
    // visible until the clock moves past its commit second, never vanishes
    let again = store.updates_since(updates.timestamp).await.unwrap();
    assert!(again.items.len() <= 1);
}

#[tokio::test]
async fn stale_clients_are_told_to_refresh() {
    let store = test_store().await;
    let updates = store.updates_since(1).await.unwrap();
    assert!(updates.must_refresh);
    assert!(updates.items.is_empty());
}

// ============================================================================
// Categories
// ============================================================================

#[tokio::test]
async fn category_names_are_validated() {
    let store = test_store().await;
    for name in ["", "A", "1bad", "has space", "x"] {
        let result = store
            .insert_category(&CategoryAdd {
                name: name.into(),
                title: "Title".into(),
                hidden_nav: false,
                hidden_main: false,
            })
            .await;
        assert!(result.is_err(), "name {name:?} should be rejected");
    }
}

#[tokio::test]
async fn disabling_a_category_frees_its_name_and_detaches_feeds() {
    let store = test_store().await;
    let cat = store
        .insert_category(&CategoryAdd {
            name: "news".into(),
            title: "News".into(),
            hidden_nav: false,
            hidden_main: false,
        })
        .await
        .unwrap();

    let feed = store.insert_feed("https://example.com/rss", "").await.unwrap();
    let assign = feed::apply_edit(FeedEdit {
        category_id: Some(cat.id()),
        ..FeedEdit::default()
    });
    let feed: Feed = store.mutate(feed.id(), |f: &Feed| Ok(assign(f))).await.unwrap();
    assert_eq!(feed.category_id, Some(cat.id()));

    let disable = category::apply_edit(CategoryEdit { disabled: true, ..CategoryEdit::default() });
    let disabled = store.mutate(cat.id(), disable).await.unwrap();
    assert!(disabled.disabled);
    assert_eq!(disabled.name, cat.id().to_string());

    // Gone from the active listing, name reusable, feeds detached
    assert!(store.current_categories().await.unwrap().is_empty());
    store
        .insert_category(&CategoryAdd {
            name: "news".into(),
            title: "News Again".into(),
            hidden_nav: false,
            hidden_main: false,
        })
        .await
        .unwrap();

    let feed: Feed = store.get(feed.id()).await.unwrap();
    assert_eq!(feed.category_id, None);
}

#[tokio::test]
async fn reorder_assigns_positions_in_list_order() {
    let store = test_store().await;
    let mut ids = Vec::new();
    for name in ["one", "two", "three"] {
        let cat = store
            .insert_category(&CategoryAdd {
                name: name.into(),
                title: name.to_uppercase(),
                hidden_nav: false,
                hidden_main: false,
            })
            .await
            .unwrap();
        ids.push(cat.id());
    }

    let reordered = store.reorder_categories(&[ids[2], ids[0]]).await.unwrap();
    assert_eq!(reordered.len(), 2);
    // Response is ordered by id, not by list position
    assert_eq!(reordered[0].id(), ids[0]);
    assert_eq!(reordered[0].sort_position, Some(1));
    assert_eq!(reordered[1].id(), ids[2]);
    assert_eq!(reordered[1].sort_position, Some(0));

    // Untouched category keeps a null position
    let all = store.current_categories().await.unwrap();
    let untouched = all.iter().find(|c| c.id() == ids[1]).unwrap();
    assert_eq!(untouched.sort_position, None);
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn closed_store_refuses_every_operation() {
    let store = test_store().await;
    store.close().await;
    // Idempotent
    store.close().await;

    assert!(matches!(
        store.current_feeds().await,
        Err(tributary::store::StoreError::Closed)
    ));
    assert!(matches!(
        store.insert_feed("https://example.com/rss", "").await,
        Err(tributary::store::StoreError::Closed)
    ));
}
