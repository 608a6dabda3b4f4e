use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};

use caseflow_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

/// How long a connection waits on SQLite's internal write lock before
/// surfacing a busy error. Sweeps and ingress share one file, so short
/// contention is normal.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the pool described by the application's `[database]` section:
/// enforced foreign keys, WAL journaling for concurrent sweep/ingress
/// access, and the file created on first run.
pub async fn connect(database: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&database.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(database.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(database.timeout_secs.max(1)))
        .connect_with(options)
        .await
}

/// Bare-URL variant for tests and one-off tools; production code goes
/// through [`connect`] with the loaded configuration.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    connect(&DatabaseConfig {
        url: database_url.to_string(),
        max_connections,
        timeout_secs,
    })
    .await
}
