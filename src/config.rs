use std::time::Duration;

use serde::Deserialize;

use crate::dispatcher::{Backoff, RetryPolicy};

/// Where messages are recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

/// What carries messages from publisher to dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    /// Durable broker table in the SQLite database.
    #[serde(alias = "broker")]
    Sqlite,
}

/// Runtime configuration, read from `OUTPOST_*` environment variables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_group: String,
    pub storage: StorageBackend,
    pub queue: QueueBackend,
    /// SQLite database file. An in-memory database is used when unset.
    pub db_path: Option<String>,
    /// Id generator partition. Derived from the process id when unset.
    pub worker_id: Option<u16>,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub retry_backoff: Backoff,
    pub max_retry_interval_ms: u64,
    pub retention_secs: u64,
    pub visibility_timeout_secs: u64,
    pub poll_timeout_ms: u64,
    pub recovery_interval_secs: u64,
    pub reap_interval_secs: u64,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("OUTPOST_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn uses_sqlite(&self) -> bool {
        self.storage == StorageBackend::Sqlite || self.queue == QueueBackend::Sqlite
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            interval: Duration::from_millis(self.retry_interval_ms),
            backoff: self.retry_backoff,
            max_interval: Duration::from_millis(self.max_retry_interval_ms),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_group: "default".to_owned(),
            storage: StorageBackend::default(),
            queue: QueueBackend::default(),
            db_path: None,
            worker_id: None,
            max_retries: 3,
            retry_interval_ms: 1000,
            retry_backoff: Backoff::default(),
            max_retry_interval_ms: 60_000,
            retention_secs: 24 * 60 * 60,
            visibility_timeout_secs: 30,
            poll_timeout_ms: 1000,
            recovery_interval_secs: 60,
            reap_interval_secs: 300,
        }
    }
}
