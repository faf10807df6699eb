//! Background deletion of settled messages.
//!
//! `Success` and `Dead` messages stay queryable for the retention window,
//! counted from their last delivery attempt, and are deleted afterwards,
//! together with staged messages of transactions that never finished.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{error::Error, store::MessageStore};

pub struct Reaper {
    store: Arc<dyn MessageStore>,
    retention: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn MessageStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Deletes everything that expired before now minus the retention
    /// window. Returns how many messages were removed.
    pub async fn reap(&self) -> Result<u64, Error> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|_| Error::invalid_parameter("retention out of range"))?;
        let deleted = self.store.delete_expired(Utc::now() - retention).await?;
        if deleted > 0 {
            tracing::info!(deleted, "reaped expired messages");
        }
        Ok(deleted)
    }

    /// Runs [`Reaper::reap`] every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = self.interval.as_secs(),
                retention_secs = self.retention.as_secs(),
                "reaper started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reap().await {
                            tracing::warn!("Reaping failed: {e}");
                        }
                    }
                }
            }

            tracing::info!("reaper stopped");
        })
    }
}
