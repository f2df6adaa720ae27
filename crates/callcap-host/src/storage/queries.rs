//! Database queries for the permission store.

use super::db::{Database, DatabaseError};
use super::models::{PermissionRecord, PermissionUsage};

impl Database {
    // =========================================================================
    // Permission record queries
    // =========================================================================

    /// Get every stored permission record.
    pub async fn get_all_permission_records(&self) -> Result<Vec<PermissionRecord>, DatabaseError> {
        let records =
            sqlx::query_as::<_, PermissionRecord>("SELECT * FROM permission_records ORDER BY app_id")
                .fetch_all(self.pool())
                .await?;

        Ok(records)
    }

    /// Get the permission record of one app.
    pub async fn get_permission_record(
        &self,
        app_id: &str,
    ) -> Result<Option<PermissionRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, PermissionRecord>(
            "SELECT * FROM permission_records WHERE app_id = ?",
        )
        .bind(app_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    /// Insert or replace the permission record of one app.
    pub async fn upsert_permission_record(
        &self,
        record: &PermissionRecord,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO permission_records (app_id, permission_map, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(app_id) DO UPDATE SET
                permission_map = excluded.permission_map,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&record.app_id)
        .bind(&record.permission_map)
        .bind(record.updated_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    // =========================================================================
    // Usage log queries
    // =========================================================================

    /// Append one usage entry.
    pub async fn append_permission_usage(
        &self,
        app_id: &str,
        permission_name: &str,
        used_at_ms: i64,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO permission_usage (app_id, permission_name, used_at_ms) VALUES (?, ?, ?)",
        )
        .bind(app_id)
        .bind(permission_name)
        .bind(used_at_ms)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Usage entries of one app, newest first, optionally strictly after `since_ms`.
    pub async fn query_permission_usage(
        &self,
        app_id: &str,
        since_ms: Option<i64>,
    ) -> Result<Vec<PermissionUsage>, DatabaseError> {
        let entries = if let Some(since) = since_ms {
            sqlx::query_as::<_, PermissionUsage>(
                "SELECT * FROM permission_usage WHERE app_id = ? AND used_at_ms > ? ORDER BY used_at_ms DESC, id DESC",
            )
            .bind(app_id)
            .bind(since)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, PermissionUsage>(
                "SELECT * FROM permission_usage WHERE app_id = ? ORDER BY used_at_ms DESC, id DESC",
            )
            .bind(app_id)
            .fetch_all(self.pool())
            .await?
        };

        Ok(entries)
    }

    /// Count usage entries of one app.
    pub async fn count_permission_usage(&self, app_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM permission_usage WHERE app_id = ?")
            .bind(app_id)
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }
}
