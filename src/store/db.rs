use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::schema;
use crate::entity::{Entity, EntityUpdate, NewItem};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed; expected during shutdown, fatal otherwise.
    #[error("store already closed")]
    Closed,

    /// A targeted update matched no row (stale id) or several (corrupt
    /// uniqueness).
    #[error("update affected {0} rows, expected exactly 1")]
    RowCount(u64),

    /// Caller input rejected before touching any table.
    #[error("{0}")]
    Invalid(String),

    #[error("database migration failed: {0}")]
    Migration(String),

    #[error("malformed value in database: {0}")]
    Malformed(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_missing_row(&self) -> bool {
        matches!(self, Self::Sqlx(sqlx::Error::RowNotFound))
    }
}

pub(super) struct Inner {
    pub(super) pool: SqlitePool,
    pub(super) dedupe: bool,
    pub(super) closed: bool,
}

/// Handle to the process-wide store. Cheap to clone; all clones share the
/// same gate and pool.
#[derive(Clone)]
pub struct Store(Arc<RwLock<Inner>>);

impl Store {
    /// Opens (creating if missing) the database at `path` and migrates it to
    /// the live schema version. `:memory:` is accepted for tests and
    /// ephemeral runs.
    pub async fn open(path: &str, dedupe: bool) -> Result<Self, StoreError> {
        if path == ":memory:" {
            tracing::warn!("using in-memory database, state will not persist between runs");
        } else {
            tracing::info!(path, "opening database");
        }

        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite:{path}?mode=rwc"))?
        }
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

        // An in-memory database exists per connection, so the pool must
        // never grow past one there.
        let pool = SqlitePoolOptions::new()
            .max_connections(if path == ":memory:" { 1 } else { 4 })
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        schema::migrate(&pool).await?;

        Ok(Self(Arc::new(RwLock::new(Inner { pool, dedupe, closed: false }))))
    }

    /// Closes the store. Idempotent; in-flight operations complete first
    /// because closing takes the exclusive half of the gate.
    pub async fn close(&self) {
        let mut inner = self.0.write().await;
        if inner.closed {
            tracing::warn!("store closed twice");
            return;
        }
        inner.closed = true;
        inner.pool.close().await;
        tracing::info!("store closed");
    }

    pub(super) async fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        let inner = self.0.read().await;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    pub(super) async fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        let inner = self.0.write().await;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    /// Current schema version, from `metadata.dbversion`.
    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let inner = self.read().await?;
        let version: String =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = 'dbversion'")
                .fetch_one(&inner.pool)
                .await?;
        version
            .parse()
            .map_err(|_| StoreError::Malformed(format!("dbversion is {version:?}")))
    }

    /// Reads one entity by id, outside any caller transaction.
    pub async fn get<T: Entity>(&self, id: i64) -> Result<T, StoreError> {
        let inner = self.read().await?;
        let entity = sqlx::query_as(&format!("{} WHERE {}.id = ?", T::SELECT, T::TABLE))
            .bind(id)
            .fetch_one(&inner.pool)
            .await?;
        Ok(entity)
    }

    /// The generic optimistic read-modify-write: open a transaction, read
    /// the entity, apply the mutator, short-circuit on no-op, otherwise
    /// execute the update (which must affect exactly one row), re-read, and
    /// commit. Returns the post-state either way. Rollback is automatic on
    /// every error path because the transaction drops unfinished.
    pub async fn mutate<T, F>(&self, id: i64, mutator: F) -> Result<T, StoreError>
    where
        T: Entity,
        F: FnOnce(&T) -> Result<EntityUpdate, StoreError>,
    {
        let inner = self.write().await?;
        let mut tx = inner.pool.begin().await?;

        let before = get_in_tx::<T>(&mut tx, id).await?;
        let update = mutator(&before)?;
        if update.is_noop() {
            tx.rollback().await?;
            tracing::debug!(table = T::TABLE, id, "no-op update");
            return Ok(before);
        }

        execute_update(&mut tx, &update).await?;
        let after = get_in_tx::<T>(&mut tx, id).await?;
        tx.commit().await?;
        Ok(after)
    }

    /// Inserts a batch of freshly fetched items, ignoring per-feed
    /// duplicates, in one transaction. Returns how many were actually new.
    ///
    /// In dedupe mode items whose URL already exists on another feed enter
    /// the store already marked read. This conflates cross-feed duplicates
    /// with legitimate cross-posts; it is opt-in for that reason.
    pub async fn insert_items(&self, items: &[NewItem]) -> Result<u64, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }

        let inner = self.write().await?;
        let dedupe = inner.dedupe;
        let mut tx = inner.pool.begin().await?;

        // Batched to stay well under SQLite's bind parameter limit.
        let mut inserted = 0;
        for chunk in items.chunks(100) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO items \
                 (feedid, key, title, url, content, timestamp, read, commit_timestamp) ",
            );
            builder.push_values(chunk, |mut row, item| {
                row.push_bind(item.feed_id)
                    .push_bind(&item.key)
                    .push_bind(&item.title)
                    .push_bind(&item.url)
                    .push_bind(&item.description)
                    .push_bind(item.timestamp);
                if dedupe {
                    row.push("EXISTS(SELECT 1 FROM items WHERE url = ")
                        .push_bind_unseparated(&item.url)
                        .push_unseparated(" AND feedid <> ")
                        .push_bind_unseparated(item.feed_id)
                        .push_unseparated(")");
                } else {
                    row.push("0");
                }
                row.push("CURRENT_TIMESTAMP");
            });

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        tracing::debug!(candidates = items.len(), inserted, "inserted items");
        Ok(inserted)
    }
}

pub(super) async fn get_in_tx<T: Entity>(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
) -> Result<T, StoreError> {
    let entity = sqlx::query_as(&format!("{} WHERE {}.id = ?", T::SELECT, T::TABLE))
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(entity)
}

pub(super) async fn execute_update(
    tx: &mut Transaction<'_, Sqlite>,
    update: &EntityUpdate,
) -> Result<(), StoreError> {
    let affected = update.query().execute(&mut **tx).await?.rows_affected();
    if affected != 1 {
        tracing::error!(table = update.table(), affected, "update affected wrong row count");
        return Err(StoreError::RowCount(affected));
    }
    Ok(())
}

/// Server timestamp for a snapshot or changefeed read. One second in the
/// past so a client that polls with this value can never miss a write
/// committed in the same second; updates are idempotent on the client.
pub(super) async fn tx_timestamp(tx: &mut Transaction<'_, Sqlite>) -> Result<i64, StoreError> {
    let now: String = sqlx::query_scalar("SELECT strftime('%s','now')")
        .fetch_one(&mut **tx)
        .await?;
    let now: i64 = now
        .parse()
        .map_err(|_| StoreError::Malformed(format!("strftime returned {now:?}")))?;
    Ok(now - 1)
}
