//! Transport queues carry envelopes from the publisher to the dispatcher.
//!
//! An envelope handed out by [`TransportQueue::receive`] stays invisible to
//! other receivers until it is acknowledged, rejected, or its visibility
//! timeout elapses, after which it is delivered again. Sending an id that is
//! already in the queue (ready, delayed or in flight) is a no-op, so
//! re-enqueueing recovered messages never duplicates them.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::{error::Error, message::Envelope};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

pub type QueueFuture<'a, T> = BoxFuture<'a, Result<T, Error>>;

pub trait TransportQueue: Send + Sync + 'static {
    /// Enqueues an envelope for immediate delivery.
    fn send<'a>(&'a self, queue: &'a str, envelope: Envelope) -> QueueFuture<'a, ()>;

    /// Enqueues an envelope that becomes deliverable after `delay`.
    fn send_delay<'a>(
        &'a self,
        queue: &'a str,
        envelope: Envelope,
        delay: Duration,
    ) -> QueueFuture<'a, ()>;

    /// Waits up to `timeout` for an envelope. Returns `None` on timeout.
    fn receive<'a>(
        &'a self,
        queue: &'a str,
        timeout: Duration,
    ) -> QueueFuture<'a, Option<Envelope>>;

    /// Waits up to `timeout` for the first envelope, then takes whatever else
    /// is ready, up to `max` in total.
    fn receive_batch<'a>(
        &'a self,
        queue: &'a str,
        max: usize,
        timeout: Duration,
    ) -> QueueFuture<'a, Vec<Envelope>>;

    /// Removes a delivered envelope for good.
    fn acknowledge<'a>(&'a self, queue: &'a str, id: u64) -> QueueFuture<'a, ()>;

    /// Gives a delivered envelope back. With `requeue` it is immediately
    /// deliverable again, otherwise it is dropped from the queue.
    fn reject<'a>(&'a self, queue: &'a str, id: u64, requeue: bool) -> QueueFuture<'a, ()>;

    /// Envelopes not yet acknowledged: ready, delayed and in flight.
    fn length<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, usize>;

    fn clear<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, ()>;

    fn delete<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, ()>;

    fn exists<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, bool>;
}

impl dyn TransportQueue {
    /// Sends on a background task and returns immediately.
    pub fn send_async(
        self: Arc<Self>,
        queue: impl Into<String>,
        envelope: Envelope,
    ) -> JoinHandle<Result<(), Error>> {
        let queue = queue.into();
        tokio::spawn(async move { self.send(&queue, envelope).await })
    }
}
