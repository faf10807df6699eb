//! Producer side of the outbox.
//!
//! Every publish records the message in the store first and only then hands
//! it to the transport queue. A failed store write fails the call; a failed
//! enqueue does not, because the stored message is picked up by the next
//! recovery sweep.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

use crate::{
    error::Error,
    id::IdGenerator,
    message::{Message, MessageKind},
    queue::TransportQueue,
    store::MessageStore,
    transaction::Scope,
};

#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn TransportQueue>,
    ids: Arc<IdGenerator>,
    default_group: String,
    source_tag: Option<String>,
}

#[bon::bon]
impl Publisher {
    #[builder]
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn TransportQueue>,
        ids: Arc<IdGenerator>,
        #[builder(into, default = "default".to_owned())] default_group: String,
        #[builder(into)] source_tag: Option<String>,
    ) -> Self {
        Self {
            store,
            queue,
            ids,
            default_group,
            source_tag,
        }
    }
}

impl Publisher {
    /// A publisher that stamps `tag` on every message it creates.
    pub fn with_source_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            source_tag: Some(tag.into()),
            ..self.clone()
        }
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    /// Publishes a message for immediate delivery to `group`, or to the
    /// default group. Returns the message id.
    pub async fn publish(
        &self,
        name: &str,
        content: impl Into<Bytes>,
        group: Option<&str>,
    ) -> Result<u64, Error> {
        let message = self.message(name, content.into(), group, MessageKind::Normal, None)?;
        self.store.put(&message).await?;
        tracing::debug!(id = message.id, name, group = %message.group, "published");

        let id = message.id;
        self.enqueue(message, None).await;
        Ok(id)
    }

    /// Publishes a message that is not delivered before `delay` has passed.
    pub async fn publish_delay(
        &self,
        name: &str,
        content: impl Into<Bytes>,
        group: Option<&str>,
        delay: Duration,
    ) -> Result<u64, Error> {
        let message = self.message(name, content.into(), group, MessageKind::Delayed, Some(delay))?;
        self.store.put(&message).await?;
        tracing::debug!(id = message.id, name, ?delay, "published delayed");

        let id = message.id;
        self.enqueue(message, Some(delay)).await;
        Ok(id)
    }

    /// Records a message in `scope`. It reaches the queue only when the
    /// scope commits.
    pub async fn publish_transactional(
        &self,
        scope: &mut impl Scope,
        name: &str,
        content: impl Into<Bytes>,
        group: Option<&str>,
    ) -> Result<u64, Error> {
        let message = self.message(
            name,
            content.into(),
            group,
            MessageKind::Transactional,
            None,
        )?;
        let id = message.id;
        scope.enlist(message).await?;
        tracing::debug!(id, name, "published in transaction");
        Ok(id)
    }

    /// Publishes `value` encoded as JSON.
    pub async fn publish_json<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        group: Option<&str>,
    ) -> Result<u64, Error> {
        let content = serde_json::to_vec(value)?;
        self.publish(name, content, group).await
    }

    fn message(
        &self,
        name: &str,
        content: Bytes,
        group: Option<&str>,
        kind: MessageKind,
        delay: Option<Duration>,
    ) -> Result<Message, Error> {
        if name.is_empty() {
            return Err(Error::invalid_parameter("message name must not be empty"));
        }

        let created_at = now();
        let due_at = delay
            .map(|delay| {
                chrono::Duration::from_std(delay)
                    .map(|delay| created_at + delay)
                    .map_err(|_| Error::invalid_parameter(format!("delay {delay:?} out of range")))
            })
            .transpose()?;

        Ok(Message::builder()
            .id(self.ids.next()?)
            .name(name)
            .group(group.unwrap_or(&self.default_group))
            .content(content)
            .kind(kind)
            .created_at(created_at)
            .maybe_due_at(due_at)
            .maybe_source_tag(self.source_tag.clone())
            .build())
    }

    async fn enqueue(&self, message: Message, delay: Option<Duration>) {
        let id = message.id;
        let queue = message.queue_name();
        let sent = match delay {
            Some(delay) => self.queue.send_delay(&queue, message.into(), delay).await,
            None => self.queue.send(&queue, message.into()).await,
        };
        if let Err(e) = sent {
            tracing::warn!(id, queue = %queue, "Failed to enqueue, leaving it to recovery: {e}");
        }
    }
}

/// Millisecond precision, which is what the durable store keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
