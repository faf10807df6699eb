//! The assembled outbox: configuration, store, queue, publisher, dispatcher
//! and reaper wired together.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, QueueBackend, StorageBackend},
    db,
    dispatcher::{DispatchEvent, Dispatcher, Handler},
    error::Error,
    id::IdGenerator,
    message::{Message, MessageStatus},
    publisher::Publisher,
    queue::{MemoryQueue, SqliteQueue, TransportQueue},
    reaper::Reaper,
    store::{MemoryStore, MessageStore, SqliteStore},
    transaction::{Scope, SharedTransaction, Transaction},
};

pub struct Relay {
    config: Config,
    pool: Option<SqlitePool>,
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn TransportQueue>,
    publisher: Publisher,
    dispatcher: Dispatcher,
    reaper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[bon::bon]
impl Relay {
    /// Connects with the default configuration: everything in memory.
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with().config(Config::default()).call().await
    }

    /// Connects the backends selected by `config`. A caller that already
    /// owns a SQLite pool (for its business tables) can pass it in; the
    /// outbox tables are migrated into it.
    #[builder]
    pub async fn connect_with(config: Config, pool: Option<SqlitePool>) -> Result<Self, Error> {
        let pool = match pool {
            Some(pool) => {
                db::migrate(&pool).await?;
                Some(pool)
            }
            None if config.uses_sqlite() => Some(db::connect(&config).await?),
            None => None,
        };
        let sqlite = || {
            pool.clone()
                .ok_or_else(|| Error::invalid_parameter("sqlite backend selected without a pool"))
        };

        let store: Arc<dyn MessageStore> = match config.storage {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Sqlite => Arc::new(SqliteStore::new(sqlite()?)),
        };
        let queue: Arc<dyn TransportQueue> = match config.queue {
            QueueBackend::Memory => Arc::new(MemoryQueue::new(config.visibility_timeout())),
            QueueBackend::Sqlite => {
                Arc::new(SqliteQueue::new(sqlite()?, config.visibility_timeout()))
            }
        };

        let ids = match config.worker_id {
            Some(worker_id) => IdGenerator::new(worker_id)?,
            None => IdGenerator::for_process(),
        };
        let partition = ids.partition();

        let publisher = Publisher::builder()
            .store(store.clone())
            .queue(queue.clone())
            .ids(Arc::new(ids))
            .default_group(config.default_group.clone())
            .build();

        let dispatcher = Dispatcher::builder()
            .store(store.clone())
            .queue(queue.clone())
            .policy(config.retry_policy())
            .default_group(config.default_group.clone())
            .poll_timeout(config.poll_timeout())
            .recovery_interval(config.recovery_interval())
            .visibility_timeout(config.visibility_timeout())
            .build();

        tracing::info!(
            storage = ?config.storage,
            queue = ?config.queue,
            partition,
            "relay connected"
        );

        Ok(Self {
            config,
            pool,
            store,
            queue,
            publisher,
            dispatcher,
            reaper: Mutex::new(None),
        })
    }
}

impl Relay {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The SQLite pool, when any backend uses SQLite.
    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TransportQueue> {
        &self.queue
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn publish(
        &self,
        name: &str,
        content: impl Into<Bytes>,
        group: Option<&str>,
    ) -> Result<u64, Error> {
        self.publisher.publish(name, content, group).await
    }

    pub async fn publish_delay(
        &self,
        name: &str,
        content: impl Into<Bytes>,
        group: Option<&str>,
        delay: Duration,
    ) -> Result<u64, Error> {
        self.publisher.publish_delay(name, content, group, delay).await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        group: Option<&str>,
    ) -> Result<u64, Error> {
        self.publisher.publish_json(name, value, group).await
    }

    pub async fn publish_transactional(
        &self,
        scope: &mut impl Scope,
        name: &str,
        content: impl Into<Bytes>,
        group: Option<&str>,
    ) -> Result<u64, Error> {
        self.publisher
            .publish_transactional(scope, name, content, group)
            .await
    }

    /// Starts a two-phase outbox transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.store.clone(), self.queue.clone())
    }

    /// Starts an outbox transaction on the store's own database connection.
    /// Only available with the SQLite store.
    pub async fn begin_shared(&self) -> Result<SharedTransaction, Error> {
        let store = self.store.as_sqlite().ok_or_else(|| {
            Error::invalid_parameter("shared transactions need the sqlite store")
        })?;
        SharedTransaction::begin(store, self.queue.clone()).await
    }

    pub fn subscribe(&self, name: impl Into<String>, group: impl Into<String>, handler: impl Handler) {
        self.dispatcher.subscribe(name, group, handler);
    }

    pub fn subscribe_default(&self, name: impl Into<String>, handler: impl Handler) {
        self.dispatcher.subscribe_default(name, handler);
    }

    pub async fn unsubscribe(&self, name: &str, group: Option<&str>) -> usize {
        self.dispatcher.unsubscribe(name, group).await
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
        self.dispatcher.events()
    }

    /// Starts the dispatcher workers and the reaper.
    pub fn start(&self) {
        self.dispatcher.start();

        let mut reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if reaper.is_none() {
            let cancel = CancellationToken::new();
            let handle = Reaper::new(
                self.store.clone(),
                self.config.retention(),
                self.config.reap_interval(),
            )
            .spawn(cancel.clone());
            *reaper = Some((cancel, handle));
        }
    }

    /// Stops the workers and the reaper, waiting for in-flight handlers.
    pub async fn stop(&self) {
        self.dispatcher.stop().await;

        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((cancel, handle)) = reaper {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!("Reaper task failed: {e}");
            }
        }
    }

    /// Looks up a stored message.
    pub async fn message(&self, id: u64) -> Result<Message, Error> {
        self.store.get(id).await
    }

    /// Gives a `Dead` or `Failed` message another delivery attempt. Its
    /// retry counter is kept, so a dead message that fails again goes
    /// straight back to `Dead`.
    pub async fn requeue(&self, id: u64) -> Result<(), Error> {
        let mut message = self.store.get(id).await?;
        if !matches!(message.status, MessageStatus::Dead | MessageStatus::Failed) {
            return Err(Error::invalid_parameter(format!(
                "message {id} is {}, only dead or failed messages can be requeued",
                message.status
            )));
        }

        let now = Utc::now();
        self.store.force_status(id, MessageStatus::Pending).await?;
        self.store.reschedule(id, now).await?;
        message.status = MessageStatus::Pending;
        message.due_at = now;

        let queue = message.queue_name();
        self.queue.send(&queue, message.into()).await?;
        tracing::info!(id, queue = %queue, "message requeued");
        Ok(())
    }

    /// Deletes a settled message and anything left of it in its queue.
    pub async fn delete(&self, id: u64) -> Result<(), Error> {
        let message = self.store.get(id).await?;
        self.store.delete(id).await?;

        match self.queue.reject(&message.queue_name(), id, false).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        tracing::info!(id, "message deleted");
        Ok(())
    }

    pub async fn failed_count(&self, name: &str, group: &str) -> Result<u64, Error> {
        self.store.failed_count(name, group).await
    }

    pub async fn pending_count(&self, name: &str, group: &str) -> Result<u64, Error> {
        self.store.pending_count(name, group).await
    }
}
