//! Durable transport queue stored in SQLite.
//!
//! This is the external-broker adapter: envelopes survive restarts, and a
//! claim is a single `UPDATE ... RETURNING` that pushes the item's
//! `visible_at` forward by the visibility timeout. An unacknowledged claim
//! therefore becomes visible again on its own, even if the consumer process
//! died.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::{sync::Notify, time::Instant};

use crate::{db::to_millis, error::Error, message::Envelope};

use super::{QueueFuture, TransportQueue};

fn unavailable(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |source| Error::QueueUnavailable {
        message: format!("{operation} failed: {source}"),
        source: Some(source),
    }
}

fn now_ms() -> i64 {
    to_millis(Utc::now())
}

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
    poll_interval: Duration,
    /// Wakes receivers in this process when something is sent or requeued.
    notify: Arc<Notify>,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval: Duration::from_millis(100),
            notify: Arc::new(Notify::new()),
        }
    }

    /// How often receivers look for envelopes sent by other processes or
    /// coming due.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn ensure_queue(&self, queue: &str) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO outpost_queues (name, created_at)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            ",
        )
        .bind(queue)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(unavailable("create queue"))?;
        Ok(())
    }

    async fn insert(&self, queue: &str, envelope: Envelope, delay: Duration) -> Result<(), Error> {
        self.ensure_queue(queue).await?;

        let now = now_ms();
        let result = sqlx::query(
            "
            INSERT INTO outpost_queue_items (queue, message_id, envelope, visible_at, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (queue, message_id) DO NOTHING
            ",
        )
        .bind(queue)
        .bind(envelope.id as i64)
        .bind(envelope.encode()?)
        .bind(now + delay.as_millis() as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(unavailable("send"))?;

        if result.rows_affected() == 0 {
            tracing::debug!(queue, id = envelope.id, "already queued, ignoring send");
        } else {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Claims up to `max` visible items in one statement.
    async fn claim(&self, queue: &str, max: usize) -> Result<Vec<Envelope>, Error> {
        let now = now_ms();
        let hidden_until = now + self.visibility_timeout.as_millis() as i64;

        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            "
            UPDATE outpost_queue_items
            SET visible_at = $1, receive_count = receive_count + 1
            WHERE rowid IN (
                SELECT rowid FROM outpost_queue_items
                WHERE queue = $2 AND visible_at <= $3
                ORDER BY visible_at, enqueued_at, message_id
                LIMIT $4
            )
            RETURNING envelope
            ",
        )
        .bind(hidden_until)
        .bind(queue)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("receive"))?;

        let mut envelopes = rows
            .iter()
            .map(|bytes| Envelope::decode(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING gives no ordering guarantee.
        envelopes.sort_by_key(|e| e.id);
        Ok(envelopes)
    }

    async fn wait_for(
        &self,
        queue: &str,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Envelope>, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = self.claim(queue, max).await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let until = (now + self.poll_interval).min(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn remove(&self, queue: &str, id: u64) -> Result<(), Error> {
        let result =
            sqlx::query("DELETE FROM outpost_queue_items WHERE queue = $1 AND message_id = $2")
                .bind(queue)
                .bind(id as i64)
                .execute(&self.pool)
                .await
                .map_err(unavailable("acknowledge"))?;

        if result.rows_affected() == 0 {
            tracing::debug!(queue, id, "removed an envelope that is not queued");
        }
        Ok(())
    }
}

impl TransportQueue for SqliteQueue {
    fn send<'a>(&'a self, queue: &'a str, envelope: Envelope) -> QueueFuture<'a, ()> {
        Box::pin(async move { self.insert(queue, envelope, Duration::ZERO).await })
    }

    fn send_delay<'a>(
        &'a self,
        queue: &'a str,
        envelope: Envelope,
        delay: Duration,
    ) -> QueueFuture<'a, ()> {
        Box::pin(async move { self.insert(queue, envelope, delay).await })
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        timeout: Duration,
    ) -> QueueFuture<'a, Option<Envelope>> {
        Box::pin(async move { Ok(self.wait_for(queue, 1, timeout).await?.pop()) })
    }

    fn receive_batch<'a>(
        &'a self,
        queue: &'a str,
        max: usize,
        timeout: Duration,
    ) -> QueueFuture<'a, Vec<Envelope>> {
        Box::pin(async move {
            if max == 0 {
                return Ok(Vec::new());
            }
            self.wait_for(queue, max, timeout).await
        })
    }

    fn acknowledge<'a>(&'a self, queue: &'a str, id: u64) -> QueueFuture<'a, ()> {
        Box::pin(async move { self.remove(queue, id).await })
    }

    fn reject<'a>(&'a self, queue: &'a str, id: u64, requeue: bool) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            if !requeue {
                return self.remove(queue, id).await;
            }

            sqlx::query(
                "UPDATE outpost_queue_items SET visible_at = $1 WHERE queue = $2 AND message_id = $3",
            )
            .bind(now_ms())
            .bind(queue)
            .bind(id as i64)
            .execute(&self.pool)
            .await
            .map_err(unavailable("reject"))?;

            self.notify.notify_waiters();
            Ok(())
        })
    }

    fn length<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, usize> {
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM outpost_queue_items WHERE queue = $1")
                    .bind(queue)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(unavailable("length"))?;
            Ok(count.max(0) as usize)
        })
    }

    fn clear<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM outpost_queue_items WHERE queue = $1")
                .bind(queue)
                .execute(&self.pool)
                .await
                .map_err(unavailable("clear"))?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable("delete"))?;

            sqlx::query("DELETE FROM outpost_queue_items WHERE queue = $1")
                .bind(queue)
                .execute(&mut *tx)
                .await
                .map_err(unavailable("delete"))?;

            sqlx::query("DELETE FROM outpost_queues WHERE name = $1")
                .bind(queue)
                .execute(&mut *tx)
                .await
                .map_err(unavailable("delete"))?;

            tx.commit().await.map_err(unavailable("delete"))?;
            Ok(())
        })
    }

    fn exists<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, bool> {
        Box::pin(async move {
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM outpost_queues WHERE name = $1)")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable("exists"))
        })
    }
}
