//! The persistent entity model: feeds, items, and categories.
//!
//! Entities are read-only snapshots of database rows. Nothing outside the
//! store mutates them in place; instead a *mutator* — a pure function from
//! the current row to an [`EntityUpdate`] — describes the intended write,
//! and the store executes it inside a transaction. Mutators compare old and
//! new state and return a no-op update when nothing changed, so callers can
//! wrap any user edit without conditional branches.

use std::borrow::Cow;
use std::fmt::{Debug, Display};

use chrono::format::StrftimeItems;
use chrono::{DateTime, Timelike, Utc};
use serde::{ser, Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::prelude::FromRow;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteArgumentValue, SqliteRow};
use sqlx::{Decode, Encode, Sqlite, Type};

pub mod category;
pub mod feed;
pub mod item;

pub use category::{Category, CategoryAdd, CategoryEdit};
pub use feed::{Feed, FeedEdit};
pub use item::{Item, NewItem};

// SQLite compares TIMESTAMP columns textually, so every timestamp we write
// must use the exact format CURRENT_TIMESTAMP produces. Second precision,
// always UTC.
const TIMESTAMP_FORMAT: StrftimeItems<'_> = StrftimeItems::new("%F %T");

/// A UTC timestamp stored as SQLite `TIMESTAMP` text at second precision.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SqlTime(pub DateTime<Utc>);

impl SqlTime {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn unix(&self) -> i64 {
        self.0.timestamp()
    }

    /// Serializer for fields exposed as Unix seconds on the wire
    /// (`commitTimestamp`, `createTimestamp`).
    pub fn unix_seconds<S>(dt: &Self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_i64(dt.0.timestamp())
    }
}

impl From<DateTime<Utc>> for SqlTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl Serialize for SqlTime {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // RFC 3339, matching what clients send back in item queries
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SqlTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        DateTime::<Utc>::deserialize(deserializer).map(Self)
    }
}

impl<'q> Encode<'q, Sqlite> for SqlTime {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        let text = self
            .0
            .with_nanosecond(0)
            .unwrap_or(self.0)
            .format_with_items(TIMESTAMP_FORMAT)
            .to_string();
        buf.push(SqliteArgumentValue::Text(Cow::Owned(text)));
        Ok(IsNull::No)
    }
}

impl<'r> Decode<'r, Sqlite> for SqlTime {
    fn decode(value: <Sqlite as sqlx::Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(DateTime::<Utc>::decode(value)?))
    }
}

impl Type<Sqlite> for SqlTime {
    fn type_info() -> <Sqlite as sqlx::Database>::TypeInfo {
        DateTime::<Utc>::type_info()
    }

    fn compatible(ty: &<Sqlite as sqlx::Database>::TypeInfo) -> bool {
        DateTime::<Utc>::compatible(ty)
    }
}

impl Debug for SqlTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0.format("%F %T"), f)
    }
}

impl Display for SqlTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// An owned SQL parameter for an [`EntityUpdate`].
#[derive(Debug, Clone)]
pub enum SqlValue {
    Int(i64),
    Text(String),
    Bool(bool),
    Time(SqlTime),
    Null,
}

impl SqlValue {
    pub fn opt_int(v: Option<i64>) -> Self {
        v.map_or(Self::Null, Self::Int)
    }

    pub fn opt_time(v: Option<SqlTime>) -> Self {
        v.map_or(Self::Null, Self::Time)
    }
}

/// A targeted write to a single entity row, produced by a mutator.
///
/// The SQL always rewrites the full row and bumps `commit_timestamp` to the
/// transaction's wall-clock second; a no-op update carries no SQL at all and
/// must never be executed.
#[derive(Debug)]
pub struct EntityUpdate {
    table: &'static str,
    noop: bool,
    sql: &'static str,
    bindings: Vec<SqlValue>,
}

impl EntityUpdate {
    pub fn noop(table: &'static str) -> Self {
        Self { table, noop: true, sql: "", bindings: Vec::new() }
    }

    pub fn write(table: &'static str, sql: &'static str, bindings: Vec<SqlValue>) -> Self {
        Self { table, noop: false, sql, bindings }
    }

    pub fn is_noop(&self) -> bool {
        self.noop
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Bind this update onto an executable query. Calling this on a no-op
    /// update is a bug in the caller.
    pub(crate) fn query(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        debug_assert!(!self.noop, "attempted to execute a no-op update");
        let mut query = sqlx::query(self.sql);
        for value in &self.bindings {
            query = match value {
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.as_str()),
                SqlValue::Bool(v) => query.bind(*v),
                SqlValue::Time(v) => query.bind(*v),
                SqlValue::Null => query.bind(None::<i64>),
            };
        }
        query
    }
}

/// Common surface of the three stored entity kinds.
pub trait Entity:
    for<'r> FromRow<'r, SqliteRow> + Serialize + Clone + Send + Unpin + Debug + 'static
{
    /// Table this entity lives in.
    const TABLE: &'static str;

    /// `SELECT ... FROM <table>` prefix used for every read of this entity,
    /// so that decorated columns (e.g. the feed's category visibility) are
    /// consistent across all query paths.
    const SELECT: &'static str;

    fn id(&self) -> i64;
}
