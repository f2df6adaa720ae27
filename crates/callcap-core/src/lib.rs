//! `callcap` Core Library
//!
//! Shared functionality for the callcap host:
//! - Bridge envelopes exchanged with mini-app script hosts
//! - Configuration resolution and hierarchy
//! - Mini-app permission catalog
//! - `SQLite` pool helpers and common error types

pub mod config;
pub mod db;
pub mod envelope;
pub mod error;
pub mod permissions;
pub mod tracing_init;

pub use config::Config;
pub use envelope::{AppRequest, AppResponse, NotifyEvent};
pub use error::{Error, Result};
pub use permissions::MiniAppPermission;
