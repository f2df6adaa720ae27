//! `SQLite` helpers shared by callcap stores.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POOL_SIZE: u32 = 5;

/// Storage faults. Callers log these; they never cross the routing core.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(e.to_string())
    }
}

/// Where a store keeps its data.
#[derive(Debug, Clone, Copy)]
pub enum DbTarget<'a> {
    File(&'a Path),
    /// Private to one connection; gone when the pool closes.
    Memory,
}

impl fmt::Display for DbTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory => f.write_str(":memory:"),
        }
    }
}

/// Connect a pool with foreign keys on.
///
/// File targets get their parent directory created, WAL journaling and a
/// busy timeout. Memory targets use a single connection, since every
/// connection would otherwise see its own empty database.
pub async fn connect(target: DbTarget<'_>) -> Result<SqlitePool, DatabaseError> {
    let (options, max_connections) = match target {
        DbTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT);
            (options, FILE_POOL_SIZE)
        }
        DbTarget::Memory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            (options, 1)
        }
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options.foreign_keys(true))
        .await
        .map_err(|e| DatabaseError::Connection(format!("{target}: {e}")))?;

    debug!(%target, max_connections, "SQLite pool connected");
    Ok(pool)
}

/// Milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Seconds since the Unix epoch.
pub fn unix_seconds() -> i64 {
    unix_millis().div_euclid(1000)
}
