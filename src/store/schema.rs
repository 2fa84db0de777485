//! Versioned schema migrations.
//!
//! A linear, append-only list. On open the current version is read from
//! `metadata.dbversion` (0 for a fresh file) and every later migration runs
//! inside its own transaction, which also records the new version. Never
//! edit a landed migration; add a new one.

use sqlx::{Connection, SqlitePool};

use super::db::StoreError;

struct Migration {
    version: i64,
    /// Rebuilds that re-point foreign keys need the enforcement off for the
    /// duration; the runner re-enables it and re-checks before continuing.
    disables_foreign_keys: bool,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        disables_foreign_keys: false,
        sql: "
CREATE TABLE metadata(
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY(key));
CREATE TABLE feeds(
    id INTEGER PRIMARY KEY,
    url TEXT UNIQUE NOT NULL,
    disabled INT NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '',
    siteurl TEXT NOT NULL DEFAULT '',
    usertitle TEXT NOT NULL DEFAULT '',
    create_timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    failing_since TIMESTAMP DEFAULT NULL);
CREATE TABLE items(
    id INTEGER PRIMARY KEY,
    feedid INTEGER NOT NULL,
    key TEXT NOT NULL,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TIMESTAMP NOT NULL,
    read INT NOT NULL DEFAULT 0,
    UNIQUE(feedid, key),
    FOREIGN KEY(feedid) REFERENCES feeds(id));
CREATE INDEX items_read_feed_index ON items(read, feedid);
CREATE INDEX feeds_disabled_index ON feeds(disabled);",
    },
    Migration {
        // Commit timestamps for the incremental changefeed.
        version: 2,
        disables_foreign_keys: false,
        sql: "
ALTER TABLE feeds ADD COLUMN
    commit_timestamp TIMESTAMP NOT NULL DEFAULT '1970-01-01 00:00:00';
ALTER TABLE items ADD COLUMN
    commit_timestamp TIMESTAMP NOT NULL DEFAULT '1970-01-01 00:00:00';
UPDATE feeds SET commit_timestamp = CURRENT_TIMESTAMP;
UPDATE items SET commit_timestamp = CURRENT_TIMESTAMP;
CREATE INDEX feeds_commit_index ON feeds(commit_timestamp);
CREATE INDEX items_commit_index ON items(commit_timestamp);",
    },
    Migration {
        version: 3,
        disables_foreign_keys: false,
        sql: "CREATE INDEX items_feed_timestamp_index ON items(feedid, timestamp);",
    },
    Migration {
        // The category rollout. Adding the foreign key to feeds requires a
        // rebuild of feeds, and the rename would re-point the items foreign
        // key at the doomed table, so items is rebuilt alongside it with
        // enforcement off for the duration.
        version: 4,
        disables_foreign_keys: true,
        sql: "
CREATE TABLE categories(
    id INTEGER PRIMARY KEY,
    disabled INT NOT NULL DEFAULT 0,
    name TEXT UNIQUE NOT NULL,
    title TEXT NOT NULL,
    hidden_nav INTEGER NOT NULL DEFAULT 0,
    hidden_main INTEGER NOT NULL DEFAULT 0,
    commit_timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP);

ALTER TABLE feeds RENAME TO feeds_old;
ALTER TABLE items RENAME TO items_old;

DROP INDEX feeds_disabled_index;
DROP INDEX feeds_commit_index;
DROP INDEX items_read_feed_index;
DROP INDEX items_commit_index;
DROP INDEX items_feed_timestamp_index;

CREATE TABLE feeds(
    id INTEGER PRIMARY KEY,
    url TEXT UNIQUE NOT NULL,
    disabled INT NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '',
    siteurl TEXT NOT NULL DEFAULT '',
    usertitle TEXT NOT NULL DEFAULT '',
    create_timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    failing_since TIMESTAMP DEFAULT NULL,
    commit_timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    categoryid INTEGER DEFAULT NULL,
    FOREIGN KEY(categoryid) REFERENCES categories(id));
CREATE TABLE items(
    id INTEGER PRIMARY KEY,
    feedid INTEGER NOT NULL,
    key TEXT NOT NULL,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TIMESTAMP NOT NULL,
    read INT NOT NULL DEFAULT 0,
    commit_timestamp TIMESTAMP NOT NULL DEFAULT '1970-01-01 00:00:00',
    UNIQUE(feedid, key),
    FOREIGN KEY(feedid) REFERENCES feeds(id));

INSERT INTO feeds SELECT *, NULL FROM feeds_old;
INSERT INTO items SELECT * FROM items_old;

DROP TABLE feeds_old;
DROP TABLE items_old;

CREATE INDEX feeds_disabled_index ON feeds(disabled);
CREATE INDEX feeds_commit_index ON feeds(commit_timestamp);
CREATE INDEX items_read_feed_index ON items(read, feedid);
CREATE INDEX items_commit_index ON items(commit_timestamp);
CREATE INDEX items_feed_timestamp_index ON items(feedid, timestamp);
CREATE INDEX categories_disabled_index ON categories(disabled);
CREATE INDEX categories_commit_index ON categories(commit_timestamp);",
    },
    Migration {
        // Cross-feed duplicate detection needs item lookup by URL.
        version: 5,
        disables_foreign_keys: false,
        sql: "CREATE INDEX items_url_index ON items(url);",
    },
    Migration {
        version: 6,
        disables_foreign_keys: false,
        sql: "ALTER TABLE categories ADD COLUMN sort_position INTEGER DEFAULT NULL;",
    },
];

pub(super) async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    // One connection for the whole run: the foreign-key pragma is
    // per-connection state.
    let mut conn = pool.acquire().await.map_err(StoreError::Sqlx)?;

    let version = current_version(&mut conn).await?;
    let latest = MIGRATIONS.last().map_or(0, |m| m.version);
    tracing::info!(version, latest, "database version");

    if version > latest {
        return Err(StoreError::Migration(format!(
            "database version {version} is newer than this binary supports ({latest})"
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > version) {
        tracing::info!(version = migration.version, "upgrading database");

        if migration.disables_foreign_keys {
            sqlx::query("PRAGMA foreign_keys = OFF")
                .execute(&mut *conn)
                .await?;
        }

        let result = apply(&mut conn, migration).await;

        if migration.disables_foreign_keys {
            // Re-enable before propagating any error so the connection
            // never returns to the pool in a weakened state.
            sqlx::raw_sql("PRAGMA foreign_keys = ON; PRAGMA foreign_key_check;")
                .execute(&mut *conn)
                .await?;
        }
        result?;
    }

    if version == 0 {
        tracing::info!("fresh database, running VACUUM");
        sqlx::query("VACUUM").execute(&mut *conn).await?;
    }

    Ok(())
}

async fn apply(
    conn: &mut sqlx::SqliteConnection,
    migration: &Migration,
) -> Result<(), StoreError> {
    let mut tx = conn.begin().await?;

    sqlx::raw_sql(migration.sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Migration(format!("version {}: {e}", migration.version)))?;

    if migration.disables_foreign_keys {
        sqlx::query("PRAGMA foreign_key_check")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Migration(format!("version {}: {e}", migration.version)))?;
    }

    sqlx::query("INSERT OR REPLACE INTO metadata(key, value) VALUES ('dbversion', ?)")
        .bind(migration.version.to_string())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

async fn current_version(conn: &mut sqlx::SqliteConnection) -> Result<i64, StoreError> {
    let has_metadata: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
    )
    .fetch_optional(&mut *conn)
    .await?;

    if has_metadata.is_none() {
        return Ok(0);
    }

    let version: Option<String> =
        sqlx::query_scalar("SELECT value FROM metadata WHERE key = 'dbversion'")
            .fetch_optional(&mut *conn)
            .await?;

    match version {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| StoreError::Malformed(format!("dbversion is {v:?}"))),
    }
}

#[cfg(test)]
pub(crate) fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}
