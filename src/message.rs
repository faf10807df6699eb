//! Message types and status management for the outbox.
//!
//! A [`Message`] is the unit the publisher records and the dispatcher
//! delivers. Its [`MessageStatus`] only moves forward:
//!
//! 1. Messages are created `Pending`
//! 2. A worker claims a message by moving it to `Processing`
//! 3. A successful delivery moves it to `Success`, a failed one to `Failed`
//! 4. A `Failed` message goes back to `Pending` for another attempt, or to
//!    `Dead` once its retries are exhausted
//!
//! `Success` and `Dead` are terminal. Both stay queryable until the reaper
//! removes them after the retention window.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a message entered the outbox.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    /// Deliverable as soon as it is enqueued
    Normal,
    /// Deliverable once `due_at` has passed
    Delayed,
    /// Deliverable once the originating transaction has committed
    Transactional,
}

/// Delivery state of a message.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be delivered (first attempt or retry)
    Pending,
    /// Claimed by a worker, handlers are running
    Processing,
    /// Every handler returned normally
    Success,
    /// The last attempt failed, a retry decision is pending
    Failed,
    /// Retries exhausted
    Dead,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Dead)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Processing -> Processing` is a re-claim of a message whose previous
    /// consumer abandoned it.
    pub fn can_transition_to(self, next: Self) -> bool {
        use MessageStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Success)
                | (Processing, Failed)
                | (Failed, Pending)
                | (Failed, Dead)
        )
    }

    /// The states `next` may be entered from.
    pub fn predecessors(next: Self) -> &'static [Self] {
        use MessageStatus::*;

        match next {
            Pending => &[Failed],
            Processing => &[Pending, Processing],
            Success | Failed => &[Processing],
            Dead => &[Failed],
        }
    }
}

/// A message recorded in the outbox.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique, time-ordered identifier assigned by the id generator
    pub id: u64,
    /// Logical topic
    pub name: String,
    /// Consumer group the message is dispatched to
    pub group: String,
    /// Opaque payload agreed upon by producer and consumer
    pub content: Bytes,
    pub kind: MessageKind,
    pub status: MessageStatus,
    /// Number of failed handler invocations so far
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the message may be handed to a consumer
    pub due_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Producer-supplied origin label, informational only
    pub source_tag: Option<String>,
    /// Whether the originating unit of work has committed. Uncommitted
    /// messages are never enqueued or dispatched.
    pub committed: bool,
}

#[bon::bon]
impl Message {
    #[builder]
    pub fn new(
        id: u64,
        #[builder(into)] name: String,
        #[builder(into)] group: String,
        #[builder(into, default)] content: Bytes,
        #[builder(default = MessageKind::Normal)] kind: MessageKind,
        #[builder(default = Utc::now())] created_at: DateTime<Utc>,
        due_at: Option<DateTime<Utc>>,
        source_tag: Option<String>,
        #[builder(default = true)] committed: bool,
    ) -> Self {
        Self {
            id,
            name,
            group,
            content,
            kind,
            status: MessageStatus::Pending,
            retries: 0,
            created_at,
            due_at: due_at.unwrap_or(created_at),
            last_attempt_at: None,
            source_tag,
            committed,
        }
    }
}

impl Message {
    /// Name of the transport queue this message travels on.
    pub fn queue_name(&self) -> String {
        queue_name(&self.name, &self.group)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    /// Decodes the content as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::error::Error> {
        Ok(serde_json::from_slice(&self.content)?)
    }
}

/// Each (name, group) pair gets its own transport queue.
pub fn queue_name(name: &str, group: &str) -> String {
    format!("{group}:{name}")
}

/// What travels over a transport queue: the message id plus a snapshot of
/// the message taken when it was enqueued.
///
/// The store stays the system of record; consumers re-read the message by id
/// before acting on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: u64,
    pub message: Message,
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            message,
        }
    }
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, crate::error::Error> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, crate::error::Error> {
        Ok(bincode::deserialize(bytes)?)
    }
}
