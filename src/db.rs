//! SQLite connection setup shared by the durable store and queue.

use chrono::{DateTime, Utc};
use snafu::ResultExt;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    config::Config,
    error::{Error, StoreUnavailableSnafu},
};

/// Opens the pool described by `config` and brings the schema up to date.
pub async fn connect(config: &Config) -> Result<SqlitePool, Error> {
    let opts = if let Some(path) = config.db_path() {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
    } else {
        SqliteConnectOptions::new().in_memory(true)
    }
    .foreign_keys(true)
    .journal_mode(SqliteJournalMode::Wal)
    .locking_mode(SqliteLockingMode::Normal)
    .optimize_on_close(true, None)
    .auto_vacuum(SqliteAutoVacuum::Full);

    let mut pool_opts = SqlitePoolOptions::new();
    if config.db_path().is_none() {
        // Every connection to `:memory:` is its own database.
        pool_opts = pool_opts
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_opts
        .connect_with(opts)
        .await
        .context(StoreUnavailableSnafu)?;

    migrate(&pool).await?;

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
