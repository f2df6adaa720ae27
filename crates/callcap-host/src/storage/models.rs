//! Database models for the permission store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::db::DatabaseError;

/// Grant map of one app: permission name -> granted.
pub type GrantMap = HashMap<String, bool>;

/// Permission record from the database, one row per app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PermissionRecord {
    pub app_id: String,
    /// JSON object of permission name -> bool.
    pub permission_map: String,
    pub updated_at: i64,
}

impl PermissionRecord {
    /// Encode a grant map into a record stamped with `updated_at`.
    pub fn from_grants(
        app_id: &str,
        grants: &GrantMap,
        updated_at: i64,
    ) -> Result<Self, DatabaseError> {
        let permission_map =
            serde_json::to_string(grants).map_err(|e| DatabaseError::Corrupt(e.to_string()))?;
        Ok(Self {
            app_id: app_id.to_string(),
            permission_map,
            updated_at,
        })
    }

    /// Decode the stored map. Entries whose value is not a bool are skipped.
    pub fn grants(&self) -> Result<GrantMap, DatabaseError> {
        let value: Value = serde_json::from_str(&self.permission_map)
            .map_err(|e| DatabaseError::Corrupt(format!("app {}: {e}", self.app_id)))?;
        let Value::Object(entries) = value else {
            return Err(DatabaseError::Corrupt(format!(
                "app {}: permission map is not an object",
                self.app_id
            )));
        };
        Ok(entries
            .into_iter()
            .filter_map(|(name, granted)| granted.as_bool().map(|g| (name, g)))
            .collect())
    }
}

/// Permission usage log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PermissionUsage {
    pub id: i64,
    pub app_id: String,
    pub permission_name: String,
    pub used_at_ms: i64,
}
