//! callcap Host Library
//!
//! Capability routing core for in-call mini-apps:
//! - Permission store and gate with usage recording
//! - Capability provider registry and out-of-process socket providers
//! - Subscription and routing table for provider callbacks
//! - Inbound event dispatch for call, app, screen-share and capability topics
//! - Host service object and NDJSON stdio bridge

pub mod call;
pub mod dispatch;
pub mod host;
pub mod link;
pub mod permission;
pub mod provider;
pub mod routing;
pub mod stdio;
pub mod storage;

pub use host::{Host, HostOptions};
