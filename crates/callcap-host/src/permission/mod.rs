//! Permission gate for mini-app actions.
//!
//! Caches per-app grant maps over the permission store, records usage and
//! propagates grant changes across the host/mini-app boundary.

mod gate;
mod types;
mod usage;

pub use gate::PermissionGate;
pub use types::{Origin, StaticSystemPermissions, SystemPermissionChecker, UsageRecord};
pub use usage::dedupe_usage;
