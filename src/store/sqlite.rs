//! SQLite-backed message store.
//!
//! Status transitions are single `UPDATE ... WHERE status IN (..)`
//! statements, so SQLite serializes concurrent transitions on the same id and
//! a terminal status can never be overwritten by a late writer.

use chrono::{DateTime, Utc};
use snafu::ResultExt;
use sqlx::{Sqlite, SqlitePool};
use tokio_stream::StreamExt;

use crate::{
    db::{from_millis, to_millis},
    error::{Error, StoreUnavailableSnafu},
    message::{Message, MessageKind, MessageStatus},
};

use super::{check_deletable, MessageStore, StoreFuture};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

/// A row of `outpost_messages`.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    name: String,
    consumer_group: String,
    content: Vec<u8>,
    kind: MessageKind,
    status: MessageStatus,
    retries: i64,
    created_at: i64,
    due_at: i64,
    last_attempt_at: Option<i64>,
    source_tag: Option<String>,
    committed: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id as u64,
            name: row.name,
            group: row.consumer_group,
            content: row.content.into(),
            kind: row.kind,
            status: row.status,
            retries: row.retries.max(0) as u32,
            created_at: from_millis(row.created_at),
            due_at: from_millis(row.due_at),
            last_attempt_at: row.last_attempt_at.map(from_millis),
            source_tag: row.source_tag,
            committed: row.committed,
        }
    }
}

/// `'a', 'b'` list of status literals for an `IN` clause.
fn status_list(statuses: &[MessageStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteStore {
    /// Wraps a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts a message through any executor, which lets the message row
    /// join a transaction the caller already holds. Returns whether the row
    /// was new.
    pub async fn insert<'c, E>(executor: E, message: &Message) -> Result<bool, Error>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let result = sqlx::query(
            "
            INSERT INTO outpost_messages (
                id, name, consumer_group, content, kind, status, retries,
                created_at, due_at, last_attempt_at, source_tag, committed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(message.id as i64)
        .bind(&message.name)
        .bind(&message.group)
        .bind(message.content.as_ref())
        .bind(message.kind)
        .bind(message.status)
        .bind(message.retries as i64)
        .bind(to_millis(message.created_at))
        .bind(to_millis(message.due_at))
        .bind(message.last_attempt_at.map(to_millis))
        .bind(&message.source_tag)
        .bind(message.committed)
        .execute(executor)
        .await
        .context(StoreUnavailableSnafu)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fetch_all<'q>(
        &self,
        query: sqlx::query::QueryAs<'q, Sqlite, MessageRow, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> Result<Vec<Message>, Error> {
        let mut rows = query.fetch(&self.pool);
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.transpose().context(StoreUnavailableSnafu)? {
            messages.push(row.into());
        }
        Ok(messages)
    }

    async fn current_status(&self, id: u64) -> Result<MessageStatus, Error> {
        sqlx::query_scalar("SELECT status FROM outpost_messages WHERE id = $1")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .context(StoreUnavailableSnafu)?
            .ok_or_else(|| Error::message_not_found(id))
    }

    async fn count(&self, name: &str, group: &str, filter: &str) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM outpost_messages
             WHERE name = $1 AND consumer_group = $2 AND {filter}"
        ))
        .bind(name)
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .context(StoreUnavailableSnafu)?;
        Ok(count.max(0) as u64)
    }
}

impl MessageStore for SqliteStore {
    fn put<'a>(&'a self, message: &'a Message) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !Self::insert(&self.pool, message).await? {
                tracing::debug!(id = message.id, "message already stored");
            }
            Ok(())
        })
    }

    fn put_batch<'a>(&'a self, messages: &'a [Message]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(StoreUnavailableSnafu)?;

            let mut inserted = 0;
            for message in messages {
                if Self::insert(&mut *tx, message).await? {
                    inserted += 1;
                }
            }

            tx.commit().await.context(StoreUnavailableSnafu)?;

            Ok(inserted)
        })
    }

    fn get(&self, id: u64) -> StoreFuture<'_, Message> {
        Box::pin(async move {
            sqlx::query_as::<_, MessageRow>("SELECT * FROM outpost_messages WHERE id = $1")
                .bind(id as i64)
                .fetch_optional(&self.pool)
                .await
                .context(StoreUnavailableSnafu)?
                .map(Message::from)
                .ok_or_else(|| Error::message_not_found(id))
        })
    }

    fn pending<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, MessageRow>(
                "
                SELECT * FROM outpost_messages
                WHERE name = $1
                  AND consumer_group = $2
                  AND committed
                  AND status IN ('pending', 'failed')
                  AND due_at <= $3
                ORDER BY due_at, id
                LIMIT $4
                ",
            )
            .bind(name)
            .bind(group)
            .bind(to_millis(Utc::now()))
            .bind(limit as i64);

            self.fetch_all(query).await
        })
    }

    fn stalled<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, MessageRow>(
                "
                SELECT * FROM outpost_messages
                WHERE name = $1
                  AND consumer_group = $2
                  AND committed
                  AND status = 'processing'
                  AND last_attempt_at < $3
                ORDER BY last_attempt_at, id
                LIMIT $4
                ",
            )
            .bind(name)
            .bind(group)
            .bind(to_millis(before))
            .bind(limit as i64);

            self.fetch_all(query).await
        })
    }

    fn update_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let from = status_list(MessageStatus::predecessors(status));
            let result = sqlx::query(&format!(
                "
                UPDATE outpost_messages
                SET status = $1,
                    last_attempt_at = CASE WHEN $1 = 'processing' THEN $2 ELSE last_attempt_at END
                WHERE id = $3 AND status IN ({from})
                "
            ))
            .bind(status)
            .bind(to_millis(Utc::now()))
            .bind(id as i64)
            .execute(&self.pool)
            .await
            .context(StoreUnavailableSnafu)?;

            if result.rows_affected() == 0 {
                let from = self.current_status(id).await?;
                return Err(Error::InvalidTransition {
                    id,
                    from,
                    to: status,
                });
            }

            Ok(())
        })
    }

    fn force_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE outpost_messages SET status = $1 WHERE id = $2")
                .bind(status)
                .bind(id as i64)
                .execute(&self.pool)
                .await
                .context(StoreUnavailableSnafu)?;

            if result.rows_affected() == 0 {
                return Err(Error::message_not_found(id));
            }
            Ok(())
        })
    }

    fn increment_retries(&self, id: u64) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let retries: i64 = sqlx::query_scalar(
                "UPDATE outpost_messages SET retries = retries + 1 WHERE id = $1 RETURNING retries",
            )
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .context(StoreUnavailableSnafu)?
            .ok_or_else(|| Error::message_not_found(id))?;

            Ok(retries.max(0) as u32)
        })
    }

    fn reschedule(&self, id: u64, due_at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE outpost_messages SET due_at = $1 WHERE id = $2")
                .bind(to_millis(due_at))
                .bind(id as i64)
                .execute(&self.pool)
                .await
                .context(StoreUnavailableSnafu)?;

            if result.rows_affected() == 0 {
                return Err(Error::message_not_found(id));
            }
            Ok(())
        })
    }

    fn commit<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(StoreUnavailableSnafu)?;

            let mut flipped = 0;
            for &id in ids {
                let result = sqlx::query(
                    "UPDATE outpost_messages SET committed = TRUE WHERE id = $1 AND NOT committed",
                )
                .bind(id as i64)
                .execute(&mut *tx)
                .await
                .context(StoreUnavailableSnafu)?;
                flipped += result.rows_affected() as usize;
            }

            tx.commit().await.context(StoreUnavailableSnafu)?;

            Ok(flipped)
        })
    }

    fn discard<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(StoreUnavailableSnafu)?;

            let mut removed = 0;
            for &id in ids {
                let result =
                    sqlx::query("DELETE FROM outpost_messages WHERE id = $1 AND NOT committed")
                        .bind(id as i64)
                        .execute(&mut *tx)
                        .await
                        .context(StoreUnavailableSnafu)?;
                removed += result.rows_affected() as usize;
            }

            tx.commit().await.context(StoreUnavailableSnafu)?;

            Ok(removed)
        })
    }

    fn delete(&self, id: u64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(StoreUnavailableSnafu)?;

            let message: Message =
                sqlx::query_as::<_, MessageRow>("SELECT * FROM outpost_messages WHERE id = $1")
                    .bind(id as i64)
                    .fetch_optional(&mut *tx)
                    .await
                    .context(StoreUnavailableSnafu)?
                    .map(Message::from)
                    .ok_or_else(|| Error::message_not_found(id))?;

            check_deletable(&message)?;

            sqlx::query("DELETE FROM outpost_messages WHERE id = $1")
                .bind(id as i64)
                .execute(&mut *tx)
                .await
                .context(StoreUnavailableSnafu)?;

            tx.commit().await.context(StoreUnavailableSnafu)?;

            Ok(())
        })
    }

    fn delete_expired(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                "
                DELETE FROM outpost_messages
                WHERE COALESCE(last_attempt_at, created_at) < $1
                  AND (status IN ('success', 'dead') OR NOT committed)
                ",
            )
            .bind(to_millis(before))
            .execute(&self.pool)
            .await
            .context(StoreUnavailableSnafu)?;

            Ok(result.rows_affected())
        })
    }

    fn failed_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.count(name, group, "status IN ('failed', 'dead')")
                .await
        })
    }

    fn pending_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.count(name, group, "committed AND status = 'pending'")
                .await
        })
    }

    fn as_sqlite(&self) -> Option<&SqliteStore> {
        Some(self)
    }
}
