use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::add_feed;
use super::{ApiError, ApiJson, ApiResult, AppState};
use crate::entity::{category, feed, item};
use crate::entity::{Category, CategoryAdd, CategoryEdit, Feed, FeedEdit, Item};
use crate::store::{CurrentState, GetItemsRequest, GetItemsResponse, Updates};

pub(super) fn api_router(state: AppState) -> Router {
    Router::new()
        // Items
        .route("/items", post(get_items))
        .route("/items/{id}/read", post(item_read))
        .route("/items/{id}/unread", post(item_unread))
        // Feeds
        .route("/feeds/disabled", get(disabled_feeds))
        .route("/feeds/add", post(add_feed::handle))
        .route("/feeds/rerun-failing", post(rerun_failing))
        .route("/feeds/{id}/edit", post(feed_edit))
        .route("/feeds/{id}/read", post(feed_read))
        .route("/feeds/{id}/rerun", post(feed_rerun))
        // Categories
        .route("/categories/add", post(category_add))
        .route("/categories/reorder", post(category_reorder))
        .route("/categories/{id}/edit", post(category_edit))
        // Sync
        .route("/current", get(current))
        .route("/updates/{timestamp}", get(updates))
        .with_state(state)
}

#[derive(Serialize, Debug)]
struct ItemsResponse {
    items: Vec<Item>,
}

async fn current(State(state): State<AppState>) -> ApiResult<Json<CurrentState>> {
    Ok(Json(state.store.current_state().await?))
}

async fn updates(
    State(state): State<AppState>,
    Path(timestamp): Path<i64>,
) -> ApiResult<Json<Updates>> {
    Ok(Json(state.store.updates_since(timestamp).await?))
}

async fn get_items(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GetItemsRequest>,
) -> ApiResult<Json<GetItemsResponse>> {
    Ok(Json(state.store.get_items(req).await?))
}

async fn item_read(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Item>> {
    set_item_read(&state, id, true).await
}

async fn item_unread(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Item>> {
    set_item_read(&state, id, false).await
}

async fn set_item_read(state: &AppState, id: i64, read: bool) -> ApiResult<Json<Item>> {
    let mark = item::set_read(read);
    let item = state.store.mutate(id, |i: &Item| Ok(mark(i))).await?;
    Ok(Json(item))
}

async fn disabled_feeds(State(state): State<AppState>) -> ApiResult<Json<Vec<Feed>>> {
    Ok(Json(state.store.disabled_feeds().await?))
}

#[derive(Deserialize, Debug)]
struct EditFeedRequest {
    edit: FeedEdit,
}

async fn feed_edit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<EditFeedRequest>,
) -> ApiResult<Json<Feed>> {
    let apply = feed::apply_edit(req.edit);
    let feed = state.store.mutate(id, |f: &Feed| Ok(apply(f))).await?;

    // Enabling, disabling, or recategorising all affect the fetch fleet.
    state.fetch.inform_feed_changed();
    Ok(Json(feed))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ReadFeedRequest {
    max_item_id: Option<i64>,
}

async fn feed_read(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<ReadFeedRequest>,
) -> ApiResult<Json<ItemsResponse>> {
    let max_item_id = req
        .max_item_id
        .ok_or_else(|| ApiError::Bad("maxItemId is a required field".into()))?;

    let items = state.store.mark_feed_read(id, max_item_id).await?;
    Ok(Json(ItemsResponse { items }))
}

async fn feed_rerun(State(state): State<AppState>, Path(id): Path<i64>) {
    state.fetch.rerun_feed(id);
}

async fn rerun_failing(State(state): State<AppState>) {
    state.fetch.rerun_failing();
}

async fn category_add(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CategoryAdd>,
) -> ApiResult<Json<Category>> {
    Ok(Json(state.store.insert_category(&req).await?))
}

#[derive(Deserialize, Debug)]
struct EditCategoryRequest {
    edit: CategoryEdit,
}

async fn category_edit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<EditCategoryRequest>,
) -> ApiResult<Json<Category>> {
    let apply = category::apply_edit(req.edit);
    let category = state.store.mutate(id, |c: &Category| apply(c)).await?;
    Ok(Json(category))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ReorderCategoriesRequest {
    category_ids: Vec<i64>,
}

#[derive(Serialize, Debug)]
struct CategoriesResponse {
    categories: Vec<Category>,
}

async fn category_reorder(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ReorderCategoriesRequest>,
) -> ApiResult<Json<CategoriesResponse>> {
    let categories = state.store.reorder_categories(&req.category_ids).await?;
    Ok(Json(CategoriesResponse { categories }))
}
