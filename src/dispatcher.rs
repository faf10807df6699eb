//! Consumer side of the outbox.
//!
//! Handlers are registered per (name, group) pair. Once started, the
//! [`Dispatcher`] runs one worker task per pair. Each worker:
//!
//! 1. Receives an envelope from the pair's transport queue
//! 2. Re-reads the message from the store and claims it (`Processing`)
//! 3. Invokes every handler registered on the pair
//! 4. Records `Success` and acknowledges, or records the failure and either
//!    schedules a retry or gives up and marks the message `Dead`
//!
//! Workers also sweep the store periodically and re-enqueue committed
//! messages that never reached the queue or whose consumer vanished.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};
use rand::Rng;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    message::{queue_name, Envelope, Message, MessageStatus},
    queue::TransportQueue,
    store::MessageStore,
};

/// Upper bound on messages re-enqueued by a single recovery sweep.
const RECOVERY_BATCH: usize = 500;

/// Pause after a store or queue failure before the worker polls again or
/// retries the failed operation.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// How the delay between attempts grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// The same interval before every retry
    #[default]
    Fixed,
    /// The interval doubles with every retry, up to the cap
    Exponential,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Handler invocations before a message is declared dead.
    pub max_retries: u32,
    pub interval: Duration,
    pub backoff: Backoff,
    /// Cap on the exponential delay.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt of a message that has failed `retries`
    /// times.
    pub fn delay_for(&self, retries: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let exponent = retries.saturating_sub(1).min(31);
                let base = self
                    .interval
                    .saturating_mul(1 << exponent)
                    .min(self.max_interval);

                let spread = base.as_millis() as u64 / 10;
                let jitter = if spread == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=spread)
                };
                (base + Duration::from_millis(jitter)).min(self.max_interval)
            }
        }
    }

    /// Whether a message that has failed `retries` times gets another try.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

/// A consumption callback.
///
/// Implemented for every `Fn(Message) -> impl Future<Output = eyre::Result<()>>`,
/// so closures and async fns can be subscribed directly.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> BoxFuture<'static, eyre::Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(self(message))
    }
}

/// Outcome notifications, mostly for tests and monitoring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchEvent {
    Succeeded { id: u64, name: String, group: String },
    Retrying { id: u64, retries: u32, delay: Duration },
    Dead { id: u64, name: String, group: String, retries: u32 },
}

struct Subscription {
    name: String,
    group: String,
    queue: String,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
}

impl Subscription {
    fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Running {
    shutdown: CancellationToken,
    workers: HashMap<String, Worker>,
}

struct Inner {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn TransportQueue>,
    policy: RetryPolicy,
    default_group: String,
    poll_timeout: Duration,
    recovery_interval: Duration,
    visibility_timeout: Duration,
    /// Keyed by queue name.
    subscriptions: papaya::HashMap<String, Arc<Subscription>>,
    running: Mutex<Option<Running>>,
    events: broadcast::Sender<DispatchEvent>,
}

/// Registry of handlers and the workers that feed them.
///
/// Cheap to clone; clones share the registry and workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

#[bon::bon]
impl Dispatcher {
    #[builder]
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn TransportQueue>,
        #[builder(default)] policy: RetryPolicy,
        #[builder(into, default = "default".to_owned())] default_group: String,
        #[builder(default = Duration::from_secs(1))] poll_timeout: Duration,
        #[builder(default = Duration::from_secs(60))] recovery_interval: Duration,
        #[builder(default = Duration::from_secs(30))] visibility_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                store,
                queue,
                policy,
                default_group,
                poll_timeout,
                recovery_interval,
                visibility_timeout,
                subscriptions: papaya::HashMap::new(),
                running: Mutex::new(None),
                events,
            }),
        }
    }
}

impl Dispatcher {
    pub fn default_group(&self) -> &str {
        &self.inner.default_group
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Registers `handler` for messages named `name` in `group`. Handlers
    /// accumulate; all of them run for every message of the pair.
    pub fn subscribe(&self, name: impl Into<String>, group: impl Into<String>, handler: impl Handler) {
        let name = name.into();
        let group = group.into();
        let queue = queue_name(&name, &group);

        let subscriptions = self.inner.subscriptions.pin();
        let subscription = subscriptions.get_or_insert_with(queue.clone(), || {
            Arc::new(Subscription {
                name: name.clone(),
                group: group.clone(),
                queue: queue.clone(),
                handlers: RwLock::new(Vec::new()),
            })
        });
        subscription
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));

        tracing::info!(%name, %group, "subscribed");

        let mut running = self.running();
        if let Some(running) = running.as_mut() {
            if !running.workers.contains_key(&queue) {
                let worker = self.spawn_worker(subscription.clone(), &running.shutdown);
                running.workers.insert(queue, worker);
            }
        }
    }

    /// Registers `handler` in the default group.
    pub fn subscribe_default(&self, name: impl Into<String>, handler: impl Handler) {
        let group = self.inner.default_group.clone();
        self.subscribe(name, group, handler);
    }

    /// Removes the handlers of one pair, or of every group subscribed to
    /// `name` when `group` is `None`, and stops their workers. Returns how
    /// many pairs were removed.
    pub async fn unsubscribe(&self, name: &str, group: Option<&str>) -> usize {
        let removed = {
            let subscriptions = self.inner.subscriptions.pin();
            let matching = subscriptions
                .iter()
                .filter(|(_, s)| s.name == name && group.map_or(true, |g| s.group == g))
                .map(|(queue, _)| queue.clone())
                .collect::<Vec<_>>();
            for queue in &matching {
                subscriptions.remove(queue);
            }
            matching
        };

        let workers = {
            let mut running = self.running();
            removed
                .iter()
                .filter_map(|queue| running.as_mut()?.workers.remove(queue))
                .collect::<Vec<_>>()
        };

        for worker in workers {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                tracing::error!("Worker task failed: {e}");
            }
        }

        if !removed.is_empty() {
            tracing::info!(name, ?group, pairs = removed.len(), "unsubscribed");
        }
        removed.len()
    }

    pub fn is_subscribed(&self, name: &str, group: &str) -> bool {
        self.inner
            .subscriptions
            .pin()
            .contains_key(&queue_name(name, group))
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Spawns a worker for every registered pair. Starting a running
    /// dispatcher does nothing.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            tracing::debug!("dispatcher already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let workers = self
            .inner
            .subscriptions
            .pin()
            .iter()
            .map(|(queue, subscription)| {
                (
                    queue.clone(),
                    self.spawn_worker(subscription.clone(), &shutdown),
                )
            })
            .collect::<HashMap<_, _>>();

        tracing::info!(workers = workers.len(), "dispatcher started");
        *running = Some(Running { shutdown, workers });
    }

    /// Signals every worker to stop and waits for them. A handler that is
    /// already running finishes first.
    pub async fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };

        running.shutdown.cancel();
        for (queue, worker) in running.workers {
            if let Err(e) = worker.handle.await {
                tracing::error!(queue, "Worker task failed: {e}");
            }
        }
        tracing::info!("dispatcher stopped");
    }

    pub fn events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    /// Re-enqueues every due or stalled message of the registered pairs,
    /// returning how many envelopes were sent.
    pub async fn recover(&self) -> Result<usize, Error> {
        let subscriptions = self
            .inner
            .subscriptions
            .pin()
            .iter()
            .map(|(_, subscription)| subscription.clone())
            .collect::<Vec<_>>();

        let mut sent = 0;
        for subscription in subscriptions {
            sent += self.inner.recover(&subscription).await?;
        }
        Ok(sent)
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_worker(&self, subscription: Arc<Subscription>, shutdown: &CancellationToken) -> Worker {
        let cancel = shutdown.child_token();
        let handle = tokio::spawn(self.inner.clone().run_worker(subscription, cancel.clone()));
        Worker { cancel, handle }
    }
}

impl Inner {
    #[tracing::instrument(skip_all, fields(queue = %subscription.queue))]
    async fn run_worker(self: Arc<Self>, subscription: Arc<Subscription>, cancel: CancellationToken) {
        let mut recovery = tokio::time::interval(self.recovery_interval);
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::debug!("worker started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = recovery.tick() => {
                    if let Err(e) = self.recover(&subscription).await {
                        tracing::warn!("Recovery sweep failed: {e}");
                    }
                    continue;
                }
                received = self.queue.receive(&subscription.queue, self.poll_timeout) => received,
            };

            match received {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.deliver(&subscription, envelope, &cancel).await {
                        tracing::warn!("Delivery interrupted: {e}");
                        self.pause(&cancel).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to receive: {e}");
                    self.pause(&cancel).await;
                }
            }
        }

        tracing::debug!("worker stopped");
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
        }
    }

    /// Runs a store or queue operation again while it fails transiently, so
    /// an outcome that is already decided gets recorded instead of the
    /// message being handled twice. Gives up once the worker is cancelled.
    async fn persist<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut attempt: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        loop {
            match attempt().await {
                Err(e) if e.is_transient() && !cancel.is_cancelled() => {
                    tracing::warn!("Failed to {operation}, retrying: {e}");
                    self.pause(cancel).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Handles one received envelope. Errors are store or queue failures;
    /// the envelope stays unacknowledged and comes back after the
    /// visibility timeout.
    async fn deliver(
        &self,
        subscription: &Subscription,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let queue = subscription.queue.as_str();
        let id = envelope.id;

        let mut message = match self.store.get(id).await {
            Ok(message) => message,
            Err(e) if e.is_not_found() => {
                tracing::debug!(id, "message no longer stored, dropping envelope");
                return self.queue.acknowledge(queue, id).await;
            }
            Err(e) => return Err(e),
        };

        if message.status.is_terminal() || !message.committed {
            tracing::debug!(id, status = %message.status, "duplicate delivery, dropping envelope");
            return self.queue.acknowledge(queue, id).await;
        }

        let now = Utc::now();
        if !message.is_due(now) {
            let wait = (message.due_at - now).to_std().unwrap_or_default();
            tracing::debug!(id, ?wait, "received before due time, deferring");
            self.queue.reject(queue, id, false).await?;
            return self.queue.send_delay(queue, message.into(), wait).await;
        }

        if message.status == MessageStatus::Failed {
            // Interrupted between recording a failure and scheduling the retry
            // or giving up.
            if !self.policy.should_retry(message.retries) {
                return self
                    .bury(subscription, id, message.retries, "retries exhausted", cancel)
                    .await;
            }
            self.store.update_status(id, MessageStatus::Pending).await?;
        }

        match self.store.update_status(id, MessageStatus::Processing).await {
            Ok(()) => {}
            Err(Error::InvalidTransition { from, .. }) => {
                tracing::debug!(id, status = %from, "message settled elsewhere, dropping envelope");
                return self.queue.acknowledge(queue, id).await;
            }
            Err(e) => return Err(e),
        }
        message.status = MessageStatus::Processing;

        tracing::debug!(id, name = %message.name, "invoking handlers");
        match invoke(subscription.handlers(), &message).await {
            Ok(()) => self.succeed(subscription, &message, cancel).await,
            Err(report) => self.fail(subscription, &message, report, cancel).await,
        }
    }

    async fn succeed(
        &self,
        subscription: &Subscription,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let (store, queue, id) = (&*self.store, &*self.queue, message.id);
        let name = subscription.queue.as_str();

        self.persist(cancel, "record success", move || {
            store.update_status(id, MessageStatus::Success)
        })
        .await?;
        self.persist(cancel, "acknowledge", move || queue.acknowledge(name, id))
            .await?;

        tracing::debug!(id, "delivered");
        let _ = self.events.send(DispatchEvent::Succeeded {
            id,
            name: subscription.name.clone(),
            group: subscription.group.clone(),
        });
        Ok(())
    }

    async fn fail(
        &self,
        subscription: &Subscription,
        message: &Message,
        report: eyre::Report,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let (store, queue, id) = (&*self.store, &*self.queue, message.id);
        let name = subscription.queue.as_str();
        let failure = Error::handler_failure(&report);

        let retries = self
            .persist(cancel, "count the retry", move || store.increment_retries(id))
            .await?;
        self.persist(cancel, "record the failure", move || {
            store.update_status(id, MessageStatus::Failed)
        })
        .await?;

        if !self.policy.should_retry(retries) {
            return self.bury(subscription, id, retries, failure, cancel).await;
        }

        let delay = self.policy.delay_for(retries);
        let due_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.persist(cancel, "schedule the retry", move || {
            store.update_status(id, MessageStatus::Pending)
        })
        .await?;
        self.persist(cancel, "schedule the retry", move || store.reschedule(id, due_at))
            .await?;

        if delay.is_zero() {
            self.persist(cancel, "requeue", move || queue.reject(name, id, true))
                .await?;
        } else {
            let mut retry = message.clone();
            retry.status = MessageStatus::Pending;
            retry.retries = retries;
            retry.due_at = due_at;
            let envelope = Envelope::from(retry);

            self.persist(cancel, "requeue", move || queue.reject(name, id, false))
                .await?;
            self.persist(cancel, "requeue", move || {
                queue.send_delay(name, envelope.clone(), delay)
            })
            .await?;
        }

        tracing::warn!(id, retries, ?delay, "{failure}, retrying");
        let _ = self.events.send(DispatchEvent::Retrying { id, retries, delay });
        Ok(())
    }

    /// Declares a `Failed` message dead and drops its envelope.
    async fn bury(
        &self,
        subscription: &Subscription,
        id: u64,
        retries: u32,
        reason: impl std::fmt::Display,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let (store, queue) = (&*self.store, &*self.queue);
        let name = subscription.queue.as_str();

        self.persist(cancel, "record the dead message", move || {
            store.update_status(id, MessageStatus::Dead)
        })
        .await?;
        self.persist(cancel, "drop the envelope", move || queue.reject(name, id, false))
            .await?;

        tracing::error!(
            id,
            name = %subscription.name,
            group = %subscription.group,
            retries,
            "{reason}, giving up"
        );
        let _ = self.events.send(DispatchEvent::Dead {
            id,
            name: subscription.name.clone(),
            group: subscription.group.clone(),
            retries,
        });
        Ok(())
    }

    async fn recover(&self, subscription: &Subscription) -> Result<usize, Error> {
        let (name, group) = (subscription.name.as_str(), subscription.group.as_str());
        let stalled_before = Utc::now()
            - chrono::Duration::from_std(self.visibility_timeout).unwrap_or(chrono::Duration::zero());

        let mut messages = self.store.pending(name, group, RECOVERY_BATCH).await?;
        messages.extend(
            self.store
                .stalled(name, group, stalled_before, RECOVERY_BATCH)
                .await?,
        );

        let sent = messages.len();
        for message in messages {
            self.queue.send(&subscription.queue, message.into()).await?;
        }

        if sent > 0 {
            tracing::info!(name, group, sent, "re-enqueued messages from the store");
        }
        Ok(sent)
    }
}

/// Runs every handler, even after one fails, and reports the first failure.
/// A panicking handler counts as a failure.
async fn invoke(handlers: Vec<Arc<dyn Handler>>, message: &Message) -> eyre::Result<()> {
    if handlers.is_empty() {
        eyre::bail!("no handler registered for {}", message.queue_name());
    }

    let mut first_error = None;
    for handler in handlers {
        let outcome = match AssertUnwindSafe(handler.handle(message.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(eyre::eyre!("handler panicked")),
        };
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use chrono::DateTime;

    use crate::{
        queue::MemoryQueue,
        store::{MemoryStore, StoreFuture},
    };

    use super::*;

    struct Fixture {
        store: MemoryStore,
        queue: Arc<MemoryQueue>,
        dispatcher: Dispatcher,
    }

    fn fixture(policy: RetryPolicy) -> Fixture {
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let dispatcher = Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .queue(queue.clone())
            .policy(policy)
            .poll_timeout(Duration::from_millis(20))
            .build();
        Fixture {
            store,
            queue,
            dispatcher,
        }
    }

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            interval: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    async fn enqueue(fixture: &Fixture, id: u64) -> Message {
        let message = Message::builder()
            .id(id)
            .name("order.created")
            .group("billing")
            .content(&b"{}"[..])
            .build();
        fixture.store.put(&message).await.unwrap();
        fixture
            .queue
            .send(&message.queue_name(), message.clone().into())
            .await
            .unwrap();
        message
    }

    async fn next_event(events: &mut broadcast::Receiver<DispatchEvent>) -> DispatchEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(7), Duration::from_secs(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn exponential_backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential,
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };

        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(440));
        assert_eq!(policy.delay_for(30), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn delivers_to_every_handler_of_the_pair() {
        let fixture = fixture(quick(3));
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            fixture.dispatcher.subscribe("order.created", "billing", move |_: Message| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    eyre::Ok(())
                }
            });
        }

        let mut events = fixture.dispatcher.events();
        fixture.dispatcher.start();
        enqueue(&fixture, 1).await;

        assert!(matches!(
            next_event(&mut events).await,
            DispatchEvent::Succeeded { id: 1, .. }
        ));
        fixture.dispatcher.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            fixture.store.get(1).await.unwrap().status,
            MessageStatus::Success
        );
        assert_eq!(fixture.queue.length("billing:order.created").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let fixture = fixture(quick(3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        fixture.dispatcher.subscribe("order.created", "billing", move |_: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(eyre::eyre!("card declined"))
            }
        });

        let mut events = fixture.dispatcher.events();
        fixture.dispatcher.start();
        enqueue(&fixture, 1).await;

        let dead = loop {
            if let DispatchEvent::Dead { retries, .. } = next_event(&mut events).await {
                break retries;
            }
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.dispatcher.stop().await;

        assert_eq!(dead, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let message = fixture.store.get(1).await.unwrap();
        assert_eq!(message.status, MessageStatus::Dead);
        assert_eq!(message.retries, 3);
    }

    async fn explode(_: Message) -> eyre::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let fixture = fixture(quick(1));
        fixture
            .dispatcher
            .subscribe("order.created", "billing", explode);

        let mut events = fixture.dispatcher.events();
        fixture.dispatcher.start();
        enqueue(&fixture, 1).await;

        assert!(matches!(
            next_event(&mut events).await,
            DispatchEvent::Dead { id: 1, retries: 1, .. }
        ));
        fixture.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn drops_envelopes_of_settled_messages() {
        let fixture = fixture(quick(3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        fixture.dispatcher.subscribe("order.created", "billing", move |_: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                eyre::Ok(())
            }
        });

        enqueue(&fixture, 1).await;
        fixture
            .store
            .force_status(1, MessageStatus::Success)
            .await
            .unwrap();
        // Envelope with no stored message behind it.
        let orphan = Message::builder()
            .id(2)
            .name("order.created")
            .group("billing")
            .build();
        fixture
            .queue
            .send("billing:order.created", orphan.into())
            .await
            .unwrap();

        fixture.dispatcher.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        fixture.dispatcher.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.queue.length("billing:order.created").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribing_while_running_starts_a_worker() {
        let fixture = fixture(quick(3));
        let mut events = fixture.dispatcher.events();
        fixture.dispatcher.start();

        fixture
            .dispatcher
            .subscribe("order.created", "billing", |_: Message| async { eyre::Ok(()) });
        enqueue(&fixture, 1).await;

        assert!(matches!(
            next_event(&mut events).await,
            DispatchEvent::Succeeded { id: 1, .. }
        ));
        fixture.dispatcher.stop().await;
        assert!(!fixture.dispatcher.is_running());
    }

    #[tokio::test]
    async fn unsubscribe_removes_pairs() {
        let fixture = fixture(quick(3));
        fixture
            .dispatcher
            .subscribe("order.created", "billing", |_: Message| async { eyre::Ok(()) });
        fixture
            .dispatcher
            .subscribe("order.created", "shipping", |_: Message| async { eyre::Ok(()) });
        fixture
            .dispatcher
            .subscribe_default("order.created", |_: Message| async { eyre::Ok(()) });
        fixture.dispatcher.start();

        assert_eq!(
            fixture
                .dispatcher
                .unsubscribe("order.created", Some("billing"))
                .await,
            1
        );
        assert!(!fixture.dispatcher.is_subscribed("order.created", "billing"));
        assert!(fixture.dispatcher.is_subscribed("order.created", "default"));

        assert_eq!(fixture.dispatcher.unsubscribe("order.created", None).await, 2);
        fixture.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn recovery_enqueues_messages_the_queue_never_saw() {
        let fixture = fixture(quick(3));
        fixture
            .dispatcher
            .subscribe("order.created", "billing", |_: Message| async { eyre::Ok(()) });

        let message = Message::builder()
            .id(1)
            .name("order.created")
            .group("billing")
            .build();
        fixture.store.put(&message).await.unwrap();

        assert_eq!(fixture.dispatcher.recover().await.unwrap(), 1);
        // Sending an id that is already queued does not duplicate it.
        assert_eq!(fixture.dispatcher.recover().await.unwrap(), 1);
        assert_eq!(fixture.queue.length("billing:order.created").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_failed_message_is_buried_without_another_attempt() {
        let fixture = fixture(quick(3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        fixture.dispatcher.subscribe("order.created", "billing", move |_: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                eyre::Ok(())
            }
        });

        // Third failure recorded, then the process died before giving up.
        let message = Message::builder()
            .id(1)
            .name("order.created")
            .group("billing")
            .build();
        fixture.store.put(&message).await.unwrap();
        fixture
            .store
            .force_status(1, MessageStatus::Failed)
            .await
            .unwrap();
        for _ in 0..3 {
            fixture.store.increment_retries(1).await.unwrap();
        }

        let mut events = fixture.dispatcher.events();
        fixture.dispatcher.start();

        assert!(matches!(
            next_event(&mut events).await,
            DispatchEvent::Dead { id: 1, retries: 3, .. }
        ));
        fixture.dispatcher.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let message = fixture.store.get(1).await.unwrap();
        assert_eq!(message.status, MessageStatus::Dead);
        assert_eq!(message.retries, 3);
        assert_eq!(fixture.queue.length("billing:order.created").await.unwrap(), 0);
    }

    /// A memory store whose next success write and next retry count fail
    /// once with a store outage.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_success: Arc<AtomicBool>,
        fail_retries: Arc<AtomicBool>,
    }

    fn outage() -> Error {
        Error::StoreUnavailable {
            source: sqlx::Error::PoolTimedOut,
        }
    }

    impl MessageStore for FlakyStore {
        fn put<'a>(&'a self, message: &'a Message) -> StoreFuture<'a, ()> {
            self.inner.put(message)
        }

        fn put_batch<'a>(&'a self, messages: &'a [Message]) -> StoreFuture<'a, usize> {
            self.inner.put_batch(messages)
        }

        fn get(&self, id: u64) -> StoreFuture<'_, Message> {
            self.inner.get(id)
        }

        fn pending<'a>(
            &'a self,
            name: &'a str,
            group: &'a str,
            limit: usize,
        ) -> StoreFuture<'a, Vec<Message>> {
            self.inner.pending(name, group, limit)
        }

        fn stalled<'a>(
            &'a self,
            name: &'a str,
            group: &'a str,
            before: DateTime<Utc>,
            limit: usize,
        ) -> StoreFuture<'a, Vec<Message>> {
            self.inner.stalled(name, group, before, limit)
        }

        fn update_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()> {
            if status == MessageStatus::Success && self.fail_success.swap(false, Ordering::SeqCst)
            {
                return Box::pin(async { Err(outage()) });
            }
            self.inner.update_status(id, status)
        }

        fn force_status(&self, id: u64, status: MessageStatus) -> StoreFuture<'_, ()> {
            self.inner.force_status(id, status)
        }

        fn increment_retries(&self, id: u64) -> StoreFuture<'_, u32> {
            if self.fail_retries.swap(false, Ordering::SeqCst) {
                return Box::pin(async { Err(outage()) });
            }
            self.inner.increment_retries(id)
        }

        fn reschedule(&self, id: u64, due_at: DateTime<Utc>) -> StoreFuture<'_, ()> {
            self.inner.reschedule(id, due_at)
        }

        fn commit<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize> {
            self.inner.commit(ids)
        }

        fn discard<'a>(&'a self, ids: &'a [u64]) -> StoreFuture<'a, usize> {
            self.inner.discard(ids)
        }

        fn delete(&self, id: u64) -> StoreFuture<'_, ()> {
            self.inner.delete(id)
        }

        fn delete_expired(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
            self.inner.delete_expired(before)
        }

        fn failed_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64> {
            self.inner.failed_count(name, group)
        }

        fn pending_count<'a>(&'a self, name: &'a str, group: &'a str) -> StoreFuture<'a, u64> {
            self.inner.pending_count(name, group)
        }
    }

    fn flaky_dispatcher(
        store: &FlakyStore,
        queue: &Arc<MemoryQueue>,
        policy: RetryPolicy,
    ) -> Dispatcher {
        Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .queue(queue.clone())
            .policy(policy)
            .poll_timeout(Duration::from_millis(20))
            .build()
    }

    #[tokio::test]
    async fn store_outage_after_success_does_not_rerun_the_handler() {
        let store = FlakyStore::default();
        store.fail_success.store(true, Ordering::SeqCst);
        // Shorter than the pause after an outage.
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(300)));
        let dispatcher = flaky_dispatcher(&store, &queue, quick(3));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        dispatcher.subscribe("order.created", "billing", move |_: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                eyre::Ok(())
            }
        });

        let message = Message::builder()
            .id(1)
            .name("order.created")
            .group("billing")
            .build();
        store.put(&message).await.unwrap();
        queue
            .send("billing:order.created", message.into())
            .await
            .unwrap();

        let mut events = dispatcher.events();
        dispatcher.start();
        assert!(matches!(
            next_event(&mut events).await,
            DispatchEvent::Succeeded { id: 1, .. }
        ));
        tokio::time::sleep(Duration::from_millis(500)).await;
        dispatcher.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(1).await.unwrap().status, MessageStatus::Success);
        assert_eq!(queue.length("billing:order.created").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_outage_while_recording_a_failure_keeps_the_count() {
        let store = FlakyStore::default();
        store.fail_retries.store(true, Ordering::SeqCst);
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let dispatcher = flaky_dispatcher(&store, &queue, quick(2));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        dispatcher.subscribe("order.created", "billing", move |_: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(eyre::eyre!("card declined"))
            }
        });

        let message = Message::builder()
            .id(1)
            .name("order.created")
            .group("billing")
            .build();
        store.put(&message).await.unwrap();
        queue
            .send("billing:order.created", message.into())
            .await
            .unwrap();

        let mut events = dispatcher.events();
        dispatcher.start();
        let retries = loop {
            if let DispatchEvent::Dead { retries, .. } = next_event(&mut events).await {
                break retries;
            }
        };
        dispatcher.stop().await;

        assert_eq!(retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get(1).await.unwrap().status, MessageStatus::Dead);
    }

    #[tokio::test]
    async fn early_envelope_waits_for_the_due_time() {
        let fixture = fixture(quick(3));
        let handled_at = Arc::new(Mutex::new(None));
        let sink = handled_at.clone();
        fixture.dispatcher.subscribe("order.created", "billing", move |_: Message| {
            *sink.lock().unwrap() = Some(Utc::now());
            async { eyre::Ok(()) }
        });

        let due_at = Utc::now() + chrono::Duration::milliseconds(300);
        let message = Message::builder()
            .id(1)
            .name("order.created")
            .group("billing")
            .due_at(due_at)
            .build();
        fixture.store.put(&message).await.unwrap();
        // Sent without its delay, as a recovery sweep racing a reschedule
        // would.
        fixture
            .queue
            .send("billing:order.created", message.into())
            .await
            .unwrap();

        let mut events = fixture.dispatcher.events();
        fixture.dispatcher.start();
        assert!(matches!(
            next_event(&mut events).await,
            DispatchEvent::Succeeded { id: 1, .. }
        ));
        fixture.dispatcher.stop().await;

        let handled = *handled_at.lock().unwrap();
        assert!(handled.is_some_and(|at| at >= due_at));
    }

    #[tokio::test]
    async fn abandoned_claim_is_redelivered_by_recovery() {
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let dispatcher = Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .queue(queue.clone())
            .policy(quick(3))
            .poll_timeout(Duration::from_millis(20))
            .recovery_interval(Duration::from_millis(50))
            .visibility_timeout(Duration::from_millis(100))
            .build();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        dispatcher.subscribe("order.created", "billing", move |_: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                eyre::Ok(())
            }
        });

        // Claimed by a consumer that crashed; its envelope is gone.
        let mut message = Message::builder()
            .id(1)
            .name("order.created")
            .group("billing")
            .build();
        message.status = MessageStatus::Processing;
        message.last_attempt_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.put(&message).await.unwrap();

        let mut events = dispatcher.events();
        dispatcher.start();
        assert!(matches!(
            next_event(&mut events).await,
            DispatchEvent::Succeeded { id: 1, .. }
        ));
        dispatcher.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let message = store.get(1).await.unwrap();
        assert_eq!(message.status, MessageStatus::Success);
        assert!(message.last_attempt_at.unwrap() > Utc::now() - chrono::Duration::minutes(1));
    }
}
