//! In-memory message store.
//!
//! Messages live in a concurrent hash map, each behind its own mutex so that
//! status transitions serialize per id without a global lock. Contents are
//! lost when the process exits; use [`super::SqliteStore`] for durability.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::{
    error::Error,
    message::{Message, MessageStatus},
};

use super::{check_deletable, check_transition, MessageStore, StoreFuture};

type Slot = Arc<Mutex<Message>>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    messages: Arc<papaya::HashMap<u64, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: u64) -> Result<Slot, Error> {
        self.messages
            .pin()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::message_not_found(id))
    }

    /// Runs `f` with the message locked.
    fn with_message<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Message) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let slot = self.slot(id)?;
        let mut message = lock(&slot);
        f(&mut message)
    }

    /// Snapshot of every message matching `filter`.
    fn collect(&self, filter: impl Fn(&Message) -> bool) -> Vec<Message> {
        let messages = self.messages.pin();
        messages
            .iter()
            .filter_map(|(_, slot)| {
                let message = lock(slot);
                filter(&message).then(|| message.clone())
            })
            .collect()
    }

    fn insert(&self, message: &Message) -> bool {
        let slot = Arc::new(Mutex::new(message.clone()));
        let messages = self.messages.pin();
        let stored = messages.get_or_insert(message.id, slot.clone());
        Arc::ptr_eq(stored, &slot)
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, Message> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn for_pair<'a>(name: &'a str, group: &'a str) -> impl Fn(&Message) -> bool + 'a {
    move |m: &Message| m.name == name && m.group == group
}

impl MessageStore for MemoryStore {
    fn put<'a>(&'a self, message: &'a Message) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !self.insert(message) {
                tracing::debug!(id = message.id, "message already stored");
            }
            Ok(())
        })
    }

    fn put_batch<'a>(&'a self, messages: &'a [Message]) -> StoreFuture<'a, usize> {
        Box::pin(async move { Ok(messages.iter().filter(|m| self.insert(m)).count()) })
    }

    fn get(&self, id: u64) -> StoreFuture<'_, Message> {
        Box::pin(async move { self.with_message(id, |m| Ok(m.clone())) })
    }

    fn pending<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let now = Utc::now();
            let in_pair = for_pair(name, group);
            let mut due = self.collect(|m| {
                in_pair(m)
                    && m.committed
                    && matches!(m.status, MessageStatus::Pending | MessageStatus::Failed)
                    && m.is_due(now)
            });
            due.sort_by_key(|m| (m.due_at, m.id));
            due.truncate(limit);
            Ok(due)
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
            let in_pair = for_pair(name, group);
            let mut stalled = self.collect(|m| {
                in_pair(m)
                    && m.committed
                    && m.status == MessageStatus::Processing
                    && m.last_attempt_at.is_some_and(|at| at < before)
            });
            stalled.sort_by_key(|m| (m.last_attempt_at, m.id));
            stalled.truncate(limit);
            Ok(stalled)
        })
    }

    fn update_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.with_message(id, |m| {
                check_transition(id, m.status, status)?;
                m.status = status;
                if status == MessageStatus::Processing {
                    m.last_attempt_at = Some(Utc::now());
                }
                Ok(())
            })
        })
    }

    fn force_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.with_message(id, |m| {
                m.status = status;
                Ok(())
            })
        })
    }

    fn increment_retries(&self, id: u64) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            self.with_message(id, |m| {
                m.retries = m.retries.saturating_add(1);
                Ok(m.retries)
            })
        })
    }

    fn reschedule(&self, id: u64, due_at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.with_message(id, |m| {
                m.due_at = due_at;
                Ok(())
            })
        })
    }

    fn commit<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut flipped = 0;
            for &id in ids {
                flipped += self.with_message(id, |m| {
                    let was = m.committed;
                    m.committed = true;
                    Ok(usize::from(!was))
                })?;
            }
            Ok(flipped)
        })
    }

    fn discard<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let messages = self.messages.pin();
            let mut removed = 0;
            for id in ids {
                let Some(slot) = messages.get(id).cloned() else {
                    continue;
                };
                // Holding the lock while removing keeps a concurrent commit
                // from slipping in between the check and the removal.
                let message = lock(&slot);
                if !message.committed {
                    messages.remove(id);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn delete(&self, id: u64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let slot = self.slot(id)?;
            let message = lock(&slot);
            check_deletable(&message)?;
            self.messages.pin().remove(&id);
            Ok(())
        })
    }

    fn delete_expired(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let messages = self.messages.pin();
            let mut removed = 0;
            for (id, slot) in messages.iter() {
                let message = lock(slot);
                let reclaimable = message.status.is_terminal() || !message.committed;
                let settled_at = message.last_attempt_at.unwrap_or(message.created_at);
                if reclaimable && settled_at < before {
                    messages.remove(id);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn failed_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let in_pair = for_pair(name, group);
            let failed = self.collect(|m| {
                in_pair(m) && matches!(m.status, MessageStatus::Failed | MessageStatus::Dead)
            });
            Ok(failed.len() as u64)
        })
    }

    fn pending_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let in_pair = for_pair(name, group);
            let pending =
                self.collect(|m| in_pair(m) && m.committed && m.status == MessageStatus::Pending);
            Ok(pending.len() as u64)
        })
    }
}
