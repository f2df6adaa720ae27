//! `SQLite` storage for the permission store.
//!
//! Provides persistence for per-app permission grants and the usage log.

mod db;
mod models;
mod queries;
mod store;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use store::{PermissionStore, SqlitePermissionStore};
