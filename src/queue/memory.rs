//! In-process transport queue.
//!
//! Every named queue is a lane with its own lock, so queues never contend
//! with each other. Receivers park on a [`Notify`] and wake up on a send, on
//! a requeue, or when the next delayed or in-flight envelope comes due.
//! Receiving never creates a queue: a receiver on a missing queue waits for
//! the first send to create it.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

use crate::{error::Error, message::Envelope};

use super::{QueueFuture, TransportQueue};

struct InFlight {
    envelope: Envelope,
    deadline: Instant,
}

#[derive(Default)]
struct LaneState {
    ready: VecDeque<Envelope>,
    delayed: BTreeMap<(Instant, u64), Envelope>,
    in_flight: HashMap<u64, InFlight>,
    /// Ids currently held in any of the above.
    known: HashSet<u64>,
}

impl LaneState {
    /// Moves due delayed envelopes and expired claims back to `ready`.
    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            self.ready.push_back(entry.remove());
        }

        let expired = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                tracing::debug!(id, "visibility timeout elapsed, redelivering");
                self.ready.push_back(flight.envelope);
            }
        }
    }

    fn claim(&mut self, deadline: Instant) -> Option<Envelope> {
        let envelope = self.ready.pop_front()?;
        self.in_flight.insert(
            envelope.id,
            InFlight {
                envelope: envelope.clone(),
                deadline,
            },
        );
        Some(envelope)
    }

    /// When something next becomes deliverable without outside help.
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.keys().next().map(|(at, _)| *at);
        let expiry = self.in_flight.values().map(|f| f.deadline).min();
        match (delayed, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.in_flight.len()
    }
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct MemoryQueue {
    lanes: Arc<papaya::HashMap<String, Arc<Lane>>>,
    /// Signalled whenever a lane is created.
    created: Arc<Notify>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            lanes: Arc::new(papaya::HashMap::new()),
            created: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    /// The lane for `queue`, created on first use.
    fn lane(&self, queue: &str) -> Arc<Lane> {
        let lanes = self.lanes.pin();
        if let Some(lane) = lanes.get(queue) {
            return lane.clone();
        }
        let lane = lanes
            .get_or_insert(queue.to_owned(), Arc::new(Lane::default()))
            .clone();
        self.created.notify_waiters();
        lane
    }

    fn existing_lane(&self, queue: &str) -> Option<Arc<Lane>> {
        self.lanes.pin().get(queue).cloned()
    }

    fn enqueue(&self, queue: &str, envelope: Envelope, due: Option<Instant>) {
        let lane = self.lane(queue);
        {
            let mut state = lane.lock();
            if !state.known.insert(envelope.id) {
                tracing::debug!(queue, id = envelope.id, "already queued, ignoring send");
                return;
            }
            match due {
                Some(at) => {
                    state.delayed.insert((at, envelope.id), envelope);
                }
                None => state.ready.push_back(envelope),
            }
        }
        lane.notify.notify_waiters();
    }

    async fn wait_for_one(&self, queue: &str, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;

        loop {
            let created = self.created.notified();
            tokio::pin!(created);
            created.as_mut().enable();

            let Some(lane) = self.existing_lane(queue) else {
                if Instant::now() >= deadline {
                    return None;
                }
                tokio::select! {
                    _ = &mut created => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                continue;
            };

            let notified = lane.notify.notified();
            tokio::pin!(notified);
            // Register before looking at the state so a send in between is
            // not missed.
            notified.as_mut().enable();

            let wakeup = {
                let mut state = lane.lock();
                let now = Instant::now();
                state.promote(now);
                if let Some(envelope) = state.claim(now + self.visibility_timeout) {
                    return Some(envelope);
                }
                state.next_wakeup()
            };

            if Instant::now() >= deadline {
                return None;
            }

            let until = wakeup.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }
}

impl TransportQueue for MemoryQueue {
    fn send<'a>(&'a self, queue: &'a str, envelope: Envelope) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            self.enqueue(queue, envelope, None);
            Ok(())
        })
    }

    fn send_delay<'a>(
        &'a self,
        queue: &'a str,
        envelope: Envelope,
        delay: Duration,
    ) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let due = (!delay.is_zero()).then(|| Instant::now() + delay);
            self.enqueue(queue, envelope, due);
            Ok(())
        })
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        timeout: Duration,
    ) -> QueueFuture<'a, Option<Envelope>> {
        Box::pin(async move { Ok(self.wait_for_one(queue, timeout).await) })
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

            let Some(first) = self.wait_for_one(queue, timeout).await else {
                return Ok(Vec::new());
            };

            let mut batch = vec![first];
            let Some(lane) = self.existing_lane(queue) else {
                return Ok(batch);
            };
            let mut state = lane.lock();
            let now = Instant::now();
            state.promote(now);
            while batch.len() < max {
                match state.claim(now + self.visibility_timeout) {
                    Some(envelope) => batch.push(envelope),
                    None => break,
                }
            }
            Ok(batch)
        })
    }

    fn acknowledge<'a>(&'a self, queue: &'a str, id: u64) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let lane = self
                .existing_lane(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;
            let mut state = lane.lock();
            if state.in_flight.remove(&id).is_some() {
                state.known.remove(&id);
            } else {
                tracing::debug!(queue, id, "acknowledged an envelope that is not in flight");
            }
            Ok(())
        })
    }

    fn reject<'a>(&'a self, queue: &'a str, id: u64, requeue: bool) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let lane = self
                .existing_lane(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;
            {
                let mut state = lane.lock();
                let Some(flight) = state.in_flight.remove(&id) else {
                    tracing::debug!(queue, id, "rejected an envelope that is not in flight");
                    return Ok(());
                };
                if requeue {
                    state.ready.push_back(flight.envelope);
                } else {
                    state.known.remove(&id);
                }
            }
            if requeue {
                lane.notify.notify_waiters();
            }
            Ok(())
        })
    }

    fn length<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, usize> {
        Box::pin(async move {
            Ok(self
                .existing_lane(queue)
                .map_or(0, |lane| lane.lock().len()))
        })
    }

    fn clear<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            if let Some(lane) = self.existing_lane(queue) {
                *lane.lock() = LaneState::default();
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let lanes = self.lanes.pin();
            if let Some(lane) = lanes.remove(queue) {
                // Receivers parked on the old lane move on to its successor.
                lane.notify.notify_waiters();
            }
            Ok(())
        })
    }

    fn exists<'a>(&'a self, queue: &'a str) -> QueueFuture<'a, bool> {
        Box::pin(async move { Ok(self.lanes.pin().contains_key(queue)) })
    }
}
