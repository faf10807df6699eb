//! Message store: the system of record for every message and its delivery
//! state.
//!
//! The [`MessageStore`] trait is implemented by an in-memory store and a
//! durable SQLite store. Implementations must serialize conflicting status
//! transitions per message id: once `Success` or `Dead` is recorded, no
//! non-administrative update may change it.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::{
    error::Error,
    message::{Message, MessageStatus},
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, Error>>;

/// Persistence, query and status transitions for outbox messages.
pub trait MessageStore: Send + Sync + 'static {
    /// Records a message. Re-putting an id that already exists is a no-op
    /// success and never changes the stored message.
    fn put<'a>(&'a self, message: &'a Message) -> StoreFuture<'a, ()>;

    /// Records several messages, returning how many were new.
    fn put_batch<'a>(&'a self, messages: &'a [Message]) -> StoreFuture<'a, usize>;

    /// Fetches a message, failing with [`Error::NotFound`] when absent.
    fn get(&self, id: u64) -> StoreFuture<'_, Message>;

    /// Up to `limit` committed `Pending` or `Failed` messages for the pair
    /// whose due time has passed, earliest due first.
    fn pending<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>>;

    /// Committed `Processing` messages for the pair last attempted before
    /// `before`, i.e. claimed by a consumer that never finished.
    fn stalled<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>>;

    /// Moves a message to `status` if the state machine allows it, failing
    /// with [`Error::InvalidTransition`] otherwise. Entering `Processing`
    /// stamps `last_attempt_at`.
    fn update_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()>;

    /// Administrative status change that bypasses the state machine.
    fn force_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()>;

    /// Adds one to the retry counter and returns the new value.
    fn increment_retries(&self, id: u64) -> StoreFuture<'_, u32>;

    /// Moves the due time of a message that is waiting for a retry.
    fn reschedule(&self, id: u64, due_at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Makes staged messages visible. Returns how many were flipped.
    fn commit<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize>;

    /// Deletes staged messages that were never committed. Committed
    /// messages are left alone.
    fn discard<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize>;

    /// Administrative deletion. Refuses committed messages that are still
    /// `Pending` or `Processing`.
    fn delete(&self, id: u64) -> StoreFuture<'_, ()>;

    /// Reclaims `Success`/`Dead` messages and abandoned uncommitted messages
    /// last touched before the cutoff. A message is last touched at its
    /// latest attempt, or at creation when it never had one.
    fn delete_expired(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Messages of the pair that failed their last attempt or are dead.
    fn failed_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64>;

    /// Committed messages of the pair waiting for delivery.
    fn pending_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64>;

    /// The SQLite store, when this store can share a transaction with
    /// business writes.
    fn as_sqlite(&self) -> Option<&SqliteStore> {
        None
    }
}

/// Checks a transition against the state machine, producing the error the
/// stores report.
pub(crate) fn check_transition(
    id: u64,
    from: MessageStatus,
    to: MessageStatus,
) -> Result<(), Error> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { id, from, to })
    }
}

pub(crate) fn check_deletable(message: &Message) -> Result<(), Error> {
    if message.committed
        && matches!(
            message.status,
            MessageStatus::Pending | MessageStatus::Processing
        )
    {
        return Err(Error::invalid_parameter(format!(
            "message {} is {}, refusing to delete",
            message.id, message.status
        )));
    }
    Ok(())
}
