//! Permission store database handle.

use std::path::Path;

use callcap_core::db::{DbTarget, connect};
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use tracing::info;

pub use callcap_core::db::DatabaseError;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Migrated pool over the permission tables.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open or create the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::open_target(DbTarget::File(path)).await
    }

    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::open_target(DbTarget::Memory).await
    }

    async fn open_target(target: DbTarget<'_>) -> Result<Self, DatabaseError> {
        let pool = connect(target).await?;
        MIGRATOR.run(&pool).await?;
        info!(%target, migrations = MIGRATOR.iter().count(), "Permission store ready");
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
