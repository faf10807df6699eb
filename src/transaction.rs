//! Outbox transactions.
//!
//! A transactional message must not reach a consumer unless the unit of work
//! that produced it commits. Two protocols are offered:
//!
//! - [`Transaction`] works with any store. Messages are recorded up front
//!   with `committed = false`, which keeps them out of every queue and
//!   recovery sweep. Committing flips them and enqueues them; rolling back,
//!   or dropping the transaction unfinished, deletes them.
//! - [`SharedTransaction`] needs the SQLite store. It wraps an sqlx
//!   transaction the caller also uses for its own writes, so the message
//!   rows commit or vanish together with the business change.
//!
//! Enqueueing happens after the commit. If the process dies in between, the
//! committed rows are still `Pending` and a dispatcher recovery sweep sends
//! them.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use snafu::ResultExt;
use sqlx::{Sqlite, SqliteConnection};

use crate::{
    error::{Error, StoreUnavailableSnafu},
    message::Message,
    queue::TransportQueue,
    store::{MessageStore, SqliteStore},
};

/// Something a transactional message can be recorded in.
pub trait Scope: Send {
    /// Records `message` as part of the unit of work.
    fn enlist(&mut self, message: Message) -> BoxFuture<'_, Result<(), Error>>;

    /// Messages recorded so far.
    fn messages(&self) -> &[Message];
}

/// Sends committed messages, logging failures instead of returning them:
/// the rows are committed and recovery will pick up whatever is missed.
async fn release(queue: &dyn TransportQueue, messages: Vec<Message>) -> Vec<u64> {
    let mut ids = Vec::with_capacity(messages.len());
    for mut message in messages {
        message.committed = true;
        let id = message.id;
        let name = message.queue_name();
        if let Err(e) = queue.send(&name, message.into()).await {
            tracing::warn!(id, queue = %name, "Failed to enqueue committed message: {e}");
        }
        ids.push(id);
    }
    ids
}

/// Two-phase outbox transaction over any [`MessageStore`].
pub struct Transaction {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn TransportQueue>,
    staged: Vec<Message>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(store: Arc<dyn MessageStore>, queue: Arc<dyn TransportQueue>) -> Self {
        Self {
            store,
            queue,
            staged: Vec::new(),
            finished: false,
        }
    }

    /// Makes the staged messages deliverable and enqueues them. Returns
    /// their ids.
    ///
    /// If the store cannot be reached the transaction is dropped, which
    /// rolls it back.
    pub async fn commit(mut self) -> Result<Vec<u64>, Error> {
        let ids = self.staged.iter().map(|m| m.id).collect::<Vec<_>>();
        if !ids.is_empty() {
            self.store.commit(&ids).await?;
        }
        self.finished = true;

        let staged = std::mem::take(&mut self.staged);
        tracing::debug!(messages = staged.len(), "transaction committed");
        Ok(release(self.queue.as_ref(), staged).await)
    }

    /// Deletes the staged messages.
    pub async fn rollback(mut self) -> Result<(), Error> {
        let ids = self.staged.iter().map(|m| m.id).collect::<Vec<_>>();
        if !ids.is_empty() {
            self.store.discard(&ids).await?;
        }
        self.finished = true;

        tracing::debug!(messages = ids.len(), "transaction rolled back");
        Ok(())
    }
}

impl Scope for Transaction {
    fn enlist(&mut self, mut message: Message) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            message.committed = false;
            self.store.put(&message).await?;
            self.staged.push(message);
            Ok(())
        })
    }

    fn messages(&self) -> &[Message] {
        &self.staged
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished || self.staged.is_empty() {
            return;
        }

        let ids = self.staged.iter().map(|m| m.id).collect::<Vec<_>>();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                messages = ids.len(),
                "transaction dropped outside a runtime, leaving staged messages to the reaper"
            );
            return;
        };

        tracing::debug!(messages = ids.len(), "transaction dropped, discarding staged messages");
        let store = self.store.clone();
        runtime.spawn(async move {
            if let Err(e) = store.discard(&ids).await {
                tracing::warn!("Failed to discard staged messages: {e}");
            }
        });
    }
}

/// Outbox transaction sharing an sqlx transaction with the caller's own
/// writes.
///
/// With an in-memory database the pool has a single connection, which this
/// transaction holds until it finishes.
pub struct SharedTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
    queue: Arc<dyn TransportQueue>,
    staged: Vec<Message>,
}

impl SharedTransaction {
    pub(crate) async fn begin(
        store: &SqliteStore,
        queue: Arc<dyn TransportQueue>,
    ) -> Result<Self, Error> {
        let tx = store.pool().begin().await.context(StoreUnavailableSnafu)?;
        Ok(Self {
            tx,
            queue,
            staged: Vec::new(),
        })
    }

    /// The connection to run business writes on.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Commits the business writes and the message rows, then enqueues the
    /// messages.
    pub async fn commit(self) -> Result<Vec<u64>, Error> {
        self.tx.commit().await.context(StoreUnavailableSnafu)?;
        tracing::debug!(messages = self.staged.len(), "shared transaction committed");
        Ok(release(self.queue.as_ref(), self.staged).await)
    }

    /// Rolls back the business writes and the message rows. Dropping the
    /// transaction does the same.
    pub async fn rollback(self) -> Result<(), Error> {
        self.tx.rollback().await.context(StoreUnavailableSnafu)?;
        tracing::debug!(messages = self.staged.len(), "shared transaction rolled back");
        Ok(())
    }
}

impl Scope for SharedTransaction {
    fn enlist(&mut self, mut message: Message) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            message.committed = true;
            SqliteStore::insert(&mut *self.tx, &message).await?;
            self.staged.push(message);
            Ok(())
        })
    }

    fn messages(&self) -> &[Message] {
        &self.staged
    }
}
