//! Permission store contract and its `SQLite` implementation.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::db::{Database, DatabaseError};
use super::models::{PermissionRecord, PermissionUsage};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Persisted per-app grant records plus the append-only usage log.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<PermissionRecord>, DatabaseError>;

    async fn get_one(&self, app_id: &str) -> Result<Option<PermissionRecord>, DatabaseError>;

    async fn upsert(&self, record: PermissionRecord) -> Result<(), DatabaseError>;

    async fn append_usage(
        &self,
        app_id: &str,
        permission_name: &str,
        used_at_ms: i64,
    ) -> Result<(), DatabaseError>;

    async fn query_usage(
        &self,
        app_id: &str,
        since_ms: Option<i64>,
    ) -> Result<Vec<PermissionUsage>, DatabaseError>;

    /// Stream of every record written after the call.
    fn updates(&self) -> BroadcastStream<PermissionRecord>;
}

/// `SQLite`-backed store. Every successful upsert is re-published to
/// [`PermissionStore::updates`] subscribers.
#[derive(Clone)]
pub struct SqlitePermissionStore {
    db: Database,
    updates_tx: broadcast::Sender<PermissionRecord>,
}

impl SqlitePermissionStore {
    pub fn new(db: Database) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { db, updates_tx }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl PermissionStore for SqlitePermissionStore {
    async fn get_all(&self) -> Result<Vec<PermissionRecord>, DatabaseError> {
        self.db.get_all_permission_records().await
    }

    async fn get_one(&self, app_id: &str) -> Result<Option<PermissionRecord>, DatabaseError> {
        self.db.get_permission_record(app_id).await
    }

    async fn upsert(&self, record: PermissionRecord) -> Result<(), DatabaseError> {
        self.db.upsert_permission_record(&record).await?;
        // No receivers is fine.
        let _ = self.updates_tx.send(record);
        Ok(())
    }

    async fn append_usage(
        &self,
        app_id: &str,
        permission_name: &str,
        used_at_ms: i64,
    ) -> Result<(), DatabaseError> {
        let id = self
            .db
            .append_permission_usage(app_id, permission_name, used_at_ms)
            .await?;
        debug!(app_id, permission_name, id, "Permission usage recorded");
        Ok(())
    }

    async fn query_usage(
        &self,
        app_id: &str,
        since_ms: Option<i64>,
    ) -> Result<Vec<PermissionUsage>, DatabaseError> {
        self.db.query_permission_usage(app_id, since_ms).await
    }

    fn updates(&self) -> BroadcastStream<PermissionRecord> {
        BroadcastStream::new(self.updates_tx.subscribe())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn upsert_is_published_to_subscribers() {
        let store = SqlitePermissionStore::new(Database::open_in_memory().await.unwrap());
        let mut updates = store.updates();

        let record = PermissionRecord {
            app_id: "app1".into(),
            permission_map: r#"{"MINIAPP_CAMERA":true}"#.into(),
            updated_at: 7,
        };
        store.upsert(record.clone()).await.unwrap();

        let received = updates.next().await.unwrap().unwrap();
        assert_eq!(received, record);
        assert_eq!(store.get_one("app1").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn upsert_without_subscribers_succeeds() {
        let store = SqlitePermissionStore::new(Database::open_in_memory().await.unwrap());
        let record = PermissionRecord {
            app_id: "app1".into(),
            permission_map: "{}".into(),
            updated_at: 1,
        };
        assert!(store.upsert(record).await.is_ok());
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }
}
