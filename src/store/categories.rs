use super::db::{execute_update, get_in_tx, Store, StoreError};
use crate::entity::{category, Category, CategoryAdd, Entity};

impl Store {
    /// Enabled categories, ordered by id. Client-side display order comes
    /// from `sort_position`; the store does not apply it.
    pub async fn current_categories(&self) -> Result<Vec<Category>, StoreError> {
        let inner = self.read().await?;
        let categories = sqlx::query_as(&format!(
            "{} WHERE categories.disabled = 0 ORDER BY categories.id ASC",
            Category::SELECT
        ))
        .fetch_all(&inner.pool)
        .await?;
        Ok(categories)
    }

    /// Creates a category after validating its name and title.
    pub async fn insert_category(&self, req: &CategoryAdd) -> Result<Category, StoreError> {
        req.validate()?;

        let inner = self.write().await?;
        tracing::info!(name = req.name, title = req.title, "adding category");

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO categories(name, title, hidden_nav, hidden_main) \
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(&req.name)
        .bind(&req.title)
        .bind(req.hidden_nav)
        .bind(req.hidden_main)
        .fetch_one(&inner.pool)
        .await?;

        let created = sqlx::query_as(&format!("{} WHERE categories.id = ?", Category::SELECT))
            .bind(id)
            .fetch_one(&inner.pool)
            .await?;
        Ok(created)
    }

    /// Rewrites the user's category ordering: each listed category gets its
    /// list index as `sort_position`, inside one transaction. Returns the
    /// affected categories ordered by id.
    pub async fn reorder_categories(&self, ids: &[i64]) -> Result<Vec<Category>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.write().await?;
        let mut tx = inner.pool.begin().await?;

        let mut reordered = Vec::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            let current = get_in_tx::<Category>(&mut tx, *id).await?;
            let update = category::set_sort_position(position as i64)(&current);
            if update.is_noop() {
                reordered.push(current);
                continue;
            }
            execute_update(&mut tx, &update).await?;
            reordered.push(get_in_tx::<Category>(&mut tx, *id).await?);
        }

        tx.commit().await?;
        reordered.sort_by_key(Category::id);
        Ok(reordered)
    }
}
