//! Permission gate types.

use std::collections::HashSet;

use serde::Serialize;

/// Which side of the host/mini-app boundary made a grant change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Edited in the host process; the mini-app is told to refresh.
    Host,
    /// Edited inside the mini-app; the host is asked to reload from store.
    MiniApp,
}

/// One line of the recent-usage display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub permission_name: String,
    pub title: String,
    pub used_at_ms: i64,
}

impl UsageRecord {
    /// Minute bucket used for display de-duplication.
    pub const fn minute(&self) -> i64 {
        self.used_at_ms.div_euclid(60_000)
    }
}

/// OS-level permission check. Answers must never be cached by callers.
pub trait SystemPermissionChecker: Send + Sync {
    fn is_granted(&self, permission: &str) -> bool;
}

/// Checker backed by a configured list of held OS permissions.
#[derive(Debug, Clone, Default)]
pub struct StaticSystemPermissions {
    granted: HashSet<String>,
}

impl StaticSystemPermissions {
    pub fn new<I, S>(granted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: granted.into_iter().map(Into::into).collect(),
        }
    }
}

impl SystemPermissionChecker for StaticSystemPermissions {
    fn is_granted(&self, permission: &str) -> bool {
        self.granted.contains(permission)
    }
}
