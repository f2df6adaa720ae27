use std::collections::HashSet;

use callcap_core::permissions::usage_title;

use super::types::UsageRecord;
use crate::storage::PermissionUsage;

/// Turn raw usage rows (newest first) into display records.
///
/// Rows whose permission has no display title are dropped, and only the
/// first row per (title, minute) is kept. Order is preserved.
pub fn dedupe_usage(entries: Vec<PermissionUsage>) -> Vec<UsageRecord> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|entry| {
            let title = usage_title(&entry.permission_name);
            if title.is_empty() {
                return None;
            }
            Some(UsageRecord {
                permission_name: entry.permission_name,
                title: title.to_string(),
                used_at_ms: entry.used_at_ms,
            })
        })
        .filter(|record| seen.insert((record.title.clone(), record.minute())))
        .collect()
}
