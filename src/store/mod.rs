//! The persistence layer: a versioned SQLite store.
//!
//! The store is the sole writer to every table. All public methods check the
//! closed flag under a process-wide reader/writer gate; reads take the
//! shared half, writes and transactions the exclusive half. The gate is a
//! belt over SQLite's own locking so the contract-level invariants
//! (closed-check, mutate-under-transaction) stay auditable in one place.

mod categories;
mod db;
mod feeds;
mod items;
mod schema;
mod state;

pub use db::{Store, StoreError};
pub use items::{GetItemsRequest, GetItemsResponse};
pub use state::{CurrentState, Updates};
