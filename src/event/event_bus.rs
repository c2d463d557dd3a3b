//! # Event Bus Implementation
//!
//! The EventBus routes published events to the handlers subscribed to their
//! type. Each (event, subscriber) pair becomes its own task, so a slow or failing
//! subscriber never delays the others.
//!
//! ## Delivery
//!
//! ```text
//! publish ─▶ validate ─▶ resolve subscribers ─┬─▶ dispatch(handler A)
//!                                             └─▶ dispatch(handler B)
//!                                                      │
//!                        ┌──────── ok ─────────────────┤
//!                        │     retryable ──▶ RetryQueue ──▶ retry worker ─┐
//!                        │     permanent ──▶ dead letter ─▶ event.failed  │
//!                        ▼                                                │
//!                 breaker updated ◀───────────────────────────────────────┘
//! ```
//!
//! - A dispatch is bounded by `handler_timeout`; breaching it counts as a fault.
//! - The destination's circuit breaker is consulted before every attempt.
//! - Retries back off exponentially with jitter, up to `max_attempts` total
//!   invocations per pair.
//! - Terminal failures are never dropped silently: they are logged, kept in the
//!   dead-letter sink and re-published as `event.failed`.
//!
//! Publishing is fire-and-forget. [`EventBus::publish`] returns once the event is
//! admitted; only schema errors reach the producer.

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::{
    future::{join_all, BoxFuture},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::{
    circuit_breaker::{BreakerPermit, CircuitBreakerRegistry, CircuitBreakerState, CircuitState},
    delivery_queue::{schedule_at, Backoff, DeadLetter, DeadLetterSink, QueueItem, RetryQueue},
    event_registry::{EventRegistry, EventType, SchemaError},
    handler::{EventHandler, HandlerError, HandlerResult},
    payload::{EventPayload, FailureReason},
};
use crate::{
    clock::{Clock, SystemClock},
    config::{DispatchConfig, SystemConfig},
};

/// # Event
///
/// The canonical envelope. Events are immutable once published; only the retry
/// queue touches `attempt`, when it re-schedules a delivery.
///
/// ## Example
///
/// ```rust,no_run
/// # use finrec::event::{Event, EventType};
/// let event = Event::new(
///     EventType::ChatMessage,
///     "discord_u1_0f3a",
///     serde_json::json!({
///         "platform": "discord",
///         "user_id": "u1",
///         "message_text": "Any low risk ETFs?",
///     }),
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub session_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    /// Zero-based index of the delivery attempt carrying this copy
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub payload: JsonValue,
}

impl Event {
    pub fn new(event_type: EventType, session_id: &str, payload: JsonValue) -> Self {
        Self {
            event_type,
            session_id: session_id.to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            attempt: 0,
            payload,
        }
    }

    pub fn from_payload<P: EventPayload>(session_id: &str, payload: &P) -> EventResult<Self> {
        let value = serde_json::to_value(payload).map_err(|e| EventError::InvalidPayload {
            event_type: P::event_type().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::new(P::event_type(), session_id, value))
    }

    /// Typed view of the payload. Fails if the event is of another type.
    pub fn payload_as<P: EventPayload>(&self) -> EventResult<P> {
        if self.event_type != P::event_type() {
            return Err(EventError::InvalidPayload {
                event_type: self.event_type.to_string(),
                message: format!("expected {} payload", P::event_type()),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| EventError::InvalidPayload {
            event_type: self.event_type.to_string(),
            message: e.to_string(),
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_string();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Schema validation failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("Invalid payload for {event_type}: {message}")]
    InvalidPayload { event_type: String, message: String },

    #[error("Circuit open for {destination}, dispatch skipped")]
    CircuitOpen { destination: String },

    #[error("Delivery to {destination} exhausted after {attempts} attempts")]
    QueueExhausted { destination: String, attempts: u32 },

    #[error("No subscription {handler_id} for {event_type}")]
    NotSubscribed {
        event_type: String,
        handler_id: String,
    },

    #[error("Event bus is shut down")]
    ShutDown,
}

pub type EventResult<T> = Result<T, EventError>;

/// Identifies one registration; pass it back to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub event_type: EventType,
    pub handler_id: String,
}

/// Result of delivering one event to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Delivered,
    /// Failed, will be retried at the given instant
    Scheduled { next_attempt_at: DateTime<Utc> },
    /// Will never be attempted again
    DeadLettered { reason: FailureReason },
    /// The subscriber went away before its retry came due
    Dropped,
}

/// Receipt for an accepted event. Dropping it does not cancel anything; it only
/// lets callers wait for the first attempt of every dispatch.
#[derive(Debug)]
pub struct Delivery {
    pub correlation_id: String,
    handles: Vec<JoinHandle<(String, DispatchOutcome)>>,
}

impl Delivery {
    pub fn subscriber_count(&self) -> usize {
        self.handles.len()
    }

    /// Waits for the first attempt against every subscriber.
    pub async fn join(self) -> Vec<(String, DispatchOutcome)> {
        join_all(self.handles)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!("Dispatch task failed: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// # EventBus
///
/// Central router. Cheap to clone; clones share the same subscriptions,
/// breakers and retry queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    registry: EventRegistry,
    subscriptions: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    breakers: CircuitBreakerRegistry,
    queue: RetryQueue,
    dead_letters: DeadLetterSink,
    /// Destinations with a retry group currently running
    retrying: DashSet<String>,
    backoff: Backoff,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Creates a bus without the background retry worker. Retries only happen
    /// when [`process_due_retries`](Self::process_due_retries) is called.
    pub fn new(config: &SystemConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &SystemConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(BusInner {
                registry: EventRegistry::new(),
                subscriptions: RwLock::new(HashMap::new()),
                breakers: CircuitBreakerRegistry::new(config.circuit_breaker),
                queue: RetryQueue::new(),
                dead_letters: DeadLetterSink::new(config.dispatch.dead_letter_capacity),
                retrying: DashSet::new(),
                backoff: Backoff::from_config(&config.dispatch),
                config: config.dispatch.clone(),
                clock,
                running: AtomicBool::new(true),
                shutdown_tx,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Creates a bus and starts its retry worker.
    pub async fn init(config: &SystemConfig) -> Self {
        let bus = Self::new(config);
        bus.start().await;
        bus
    }

    /// Starts the periodic retry sweep. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.inner.config.retry_poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        *worker = Some(tokio::spawn(async move {
            debug!("Retry worker started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // groups run detached so a slow destination never delays the next tick
                        inner.spawn_due_retries().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Retry worker stopped");
        }));
        info!("Event bus started");
    }

    /// Stops accepting events and stops the retry worker. Dispatches already in
    /// flight run to completion; pending retries stay queued.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());
        if let Some(handle) = self.inner.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Retry worker ended abnormally: {}", e);
            }
        }
        info!("Event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Registers `handler` for `event_type`. Registering the same handler id for
    /// the same type again changes nothing.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let handler_id = handler.id();
        let mut subscriptions = self.inner.subscriptions.write().await;
        let handlers = subscriptions.entry(event_type.clone()).or_default();
        if handlers.iter().any(|h| h.id() == handler_id) {
            debug!("{} already subscribed to {}", handler_id, event_type);
        } else {
            handlers.push(handler);
            info!("{} subscribed to {}", handler_id, event_type);
        }
        SubscriptionHandle {
            event_type,
            handler_id,
        }
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> EventResult<()> {
        let mut subscriptions = self.inner.subscriptions.write().await;
        let not_subscribed = || EventError::NotSubscribed {
            event_type: handle.event_type.to_string(),
            handler_id: handle.handler_id.clone(),
        };
        let handlers = subscriptions
            .get_mut(&handle.event_type)
            .ok_or_else(not_subscribed)?;
        let before = handlers.len();
        handlers.retain(|h| h.id() != handle.handler_id);
        if handlers.len() == before {
            return Err(not_subscribed());
        }
        if handlers.is_empty() {
            subscriptions.remove(&handle.event_type);
        }
        info!("{} unsubscribed from {}", handle.handler_id, handle.event_type);
        Ok(())
    }

    pub async fn subscriber_count(&self, event_type: &EventType) -> usize {
        self.inner
            .subscriptions
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Validates and dispatches `event` to every subscriber of its type.
    ///
    /// # Errors
    ///
    /// * `EventError::Schema` - the event is malformed; nothing was dispatched
    /// * `EventError::ShutDown` - the bus no longer accepts events
    pub async fn publish(&self, event: Event) -> EventResult<Delivery> {
        self.inner.publish(event).await
    }

    pub async fn publish_payload<P: EventPayload>(
        &self,
        session_id: &str,
        payload: &P,
    ) -> EventResult<Delivery> {
        let event = Event::from_payload(session_id, payload)?.with_timestamp(self.inner.clock.now());
        self.publish(event).await
    }

    /// Runs one retry sweep: every queued delivery due now is re-attempted.
    /// Returns the number of items taken off the queue.
    pub async fn process_due_retries(&self) -> usize {
        self.inner.process_due_retries().await
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.inner.registry
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    pub async fn pending_retries(&self) -> usize {
        self.inner.queue.len().await
    }

    pub async fn retry_items(&self) -> Vec<QueueItem> {
        self.inner.queue.pending().await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.snapshot().await
    }

    pub fn breaker_snapshot(&self, destination: &str) -> Option<CircuitBreakerState> {
        self.inner.breakers.snapshot(destination)
    }
}

impl BusInner {
    async fn publish(self: &Arc<Self>, event: Event) -> EventResult<Delivery> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EventError::ShutDown);
        }
        self.registry.validate(&event)?;

        let handlers = self.handlers_for(&event.event_type).await;
        let correlation_id = event.correlation_id.clone();
        if handlers.is_empty() {
            debug!("No subscribers for {}, dropping {}", event.event_type, correlation_id);
            return Ok(Delivery {
                correlation_id,
                handles: Vec::new(),
            });
        }

        debug_event("Publishing", &event);
        let handles = handlers
            .into_iter()
            .map(|handler| tokio::spawn(self.clone().dispatch_task(event.clone(), handler)))
            .collect();
        Ok(Delivery {
            correlation_id,
            handles,
        })
    }

    async fn handlers_for(&self, event_type: &EventType) -> Vec<Arc<dyn EventHandler>> {
        self.subscriptions
            .read()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    async fn find_handler(
        &self,
        event_type: &EventType,
        handler_id: &str,
    ) -> Option<Arc<dyn EventHandler>> {
        self.subscriptions
            .read()
            .await
            .get(event_type)
            .and_then(|handlers| handlers.iter().find(|h| h.id() == handler_id).cloned())
    }

    // Boxed so the spawn inside `publish` does not make this future's type recursive.
    fn dispatch_task(
        self: Arc<Self>,
        event: Event,
        handler: Arc<dyn EventHandler>,
    ) -> BoxFuture<'static, (String, DispatchOutcome)> {
        Box::pin(async move {
            let destination = handler.id();
            let outcome = self.deliver(event, handler).await;
            (destination, outcome)
        })
    }

    /// First attempt for one (event, subscriber) pair.
    #[instrument(skip(self, event, handler), fields(event_type = %event.event_type, destination = %handler.id()))]
    async fn deliver(self: &Arc<Self>, event: Event, handler: Arc<dyn EventHandler>) -> DispatchOutcome {
        let destination = handler.id();
        let now = self.clock.now();
        let Some(permit) = self.breakers.try_acquire(&destination, now) else {
            return self.reject(QueueItem::new(event, &destination, self.config.max_attempts), now).await;
        };

        let result = self.invoke(handler.as_ref(), &event).await;
        let item = QueueItem::new(event, &destination, self.config.max_attempts);
        self.settle(item, permit, result).await
    }

    async fn process_due_retries(self: &Arc<Self>) -> usize {
        let (count, groups) = self.spawn_due_retries().await;
        for result in join_all(groups).await {
            if let Err(e) = result {
                warn!("Retry group ended abnormally: {}", e);
            }
        }
        count
    }

    /// Pops due items and starts one task per destination. A destination whose
    /// previous group is still running keeps its items queued for a later sweep.
    async fn spawn_due_retries(self: &Arc<Self>) -> (usize, Vec<JoinHandle<()>>) {
        let mut claimed = HashSet::new();
        let due = self
            .queue
            .pop_due_except(self.clock.now(), |item| {
                if claimed.contains(&item.destination) {
                    return false;
                }
                if self.retrying.insert(item.destination.clone()) {
                    claimed.insert(item.destination.clone());
                    return false;
                }
                true
            })
            .await;
        let count = due.len();
        if count == 0 {
            return (0, Vec::new());
        }
        trace!("Retry sweep picked up {} items", count);

        // per destination in queue order; destinations run concurrently
        let mut groups: HashMap<String, Vec<QueueItem>> = HashMap::new();
        for item in due {
            groups.entry(item.destination.clone()).or_default().push(item);
        }
        let handles = groups
            .into_iter()
            .map(|(destination, items)| {
                let inner = self.clone();
                tokio::spawn(async move {
                    for item in items {
                        inner.retry(item).await;
                    }
                    inner.retrying.remove(&destination);
                })
            })
            .collect();
        (count, handles)
    }

    async fn retry(self: &Arc<Self>, mut item: QueueItem) -> DispatchOutcome {
        let Some(handler) = self
            .find_handler(&item.event.event_type, &item.destination)
            .await
        else {
            warn!(
                "Dropping retry of {} for {}: no longer subscribed",
                item.event.correlation_id, item.destination
            );
            return DispatchOutcome::Dropped;
        };

        let now = self.clock.now();
        let Some(permit) = self.breakers.try_acquire(&item.destination, now) else {
            let at = self
                .breakers
                .reopens_at(&item.destination)
                .filter(|at| *at > now)
                .unwrap_or_else(|| schedule_at(now, self.config.retry_poll_interval));
            debug!(
                "Circuit open for {}, deferring retry of {} to {}",
                item.destination, item.event.correlation_id, at
            );
            item.next_attempt_at = at;
            self.queue.push(item).await;
            return DispatchOutcome::Scheduled { next_attempt_at: at };
        };

        let result = self.invoke(handler.as_ref(), &item.event).await;
        self.settle(item, permit, result).await
    }

    /// Runs the handler under the dispatch deadline. Panics and timeouts are
    /// reported as retryable faults.
    async fn invoke(&self, handler: &dyn EventHandler, event: &Event) -> HandlerResult {
        let timeout = self.config.handler_timeout;
        let call = AssertUnwindSafe(handler.handle(event)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HandlerError::retryable(format!(
                "handler {} panicked",
                handler.id()
            ))),
            Err(_) => Err(HandlerError::Timeout {
                handler_id: handler.id(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Applies a dispatch result to the breaker and decides the item's fate.
    async fn settle(
        self: &Arc<Self>,
        mut item: QueueItem,
        permit: BreakerPermit,
        result: HandlerResult,
    ) -> DispatchOutcome {
        let now = self.clock.now();
        let destination = item.destination.clone();
        match result {
            Ok(()) => {
                self.breakers.record_success(&destination, permit);
                trace!("Delivered {} to {}", item.event.correlation_id, destination);
                DispatchOutcome::Delivered
            }
            Err(e) if !e.is_retryable() => {
                // the destination answered, so its breaker stays healthy
                self.breakers.record_success(&destination, permit);
                let message = e.message();
                item.record_failure(now, &message);
                warn!("{} rejected {} permanently: {}", destination, item.event.correlation_id, message);
                self.dead_letter(DeadLetter::from_item(item, FailureReason::Permanent, now))
                    .await;
                DispatchOutcome::DeadLettered {
                    reason: FailureReason::Permanent,
                }
            }
            Err(e) => {
                self.breakers.record_failure(&destination, permit, now);
                if item.record_failure(now, &e.to_string()) {
                    warn!(
                        "{}",
                        EventError::QueueExhausted {
                            destination: destination.clone(),
                            attempts: item.attempts_made,
                        }
                    );
                    self.dead_letter(DeadLetter::from_item(item, FailureReason::Exhausted, now))
                        .await;
                    return DispatchOutcome::DeadLettered {
                        reason: FailureReason::Exhausted,
                    };
                }
                if self.breakers.state(&destination) == Some(CircuitState::Open) {
                    return self.reject(item, now).await;
                }

                let delay = self.backoff.delay(item.attempts_made - 1);
                let at = schedule_at(now, delay);
                item.schedule(at);
                warn!(
                    "Dispatch of {} to {} failed (attempt {}/{}): {}. Retrying in {:?}",
                    item.event.correlation_id,
                    destination,
                    item.attempts_made,
                    item.max_attempts,
                    e,
                    delay
                );
                self.queue.push(item).await;
                DispatchOutcome::Scheduled { next_attempt_at: at }
            }
        }
    }

    async fn reject(self: &Arc<Self>, item: QueueItem, now: DateTime<Utc>) -> DispatchOutcome {
        let error = EventError::CircuitOpen {
            destination: item.destination.clone(),
        };
        warn!("{} ({})", error, item.event.correlation_id);
        let mut letter = DeadLetter::from_item(item, FailureReason::CircuitOpen, now);
        letter.error = error.to_string();
        self.dead_letter(letter).await;
        DispatchOutcome::DeadLettered {
            reason: FailureReason::CircuitOpen,
        }
    }

    async fn dead_letter(self: &Arc<Self>, letter: DeadLetter) {
        self.dead_letters.record(letter.clone()).await;

        // failures of failure reports are only logged
        if letter.event.event_type == EventType::EventFailed {
            return;
        }
        let failed = match Event::from_payload(&letter.event.session_id, &letter.to_payload()) {
            Ok(event) => event
                .with_correlation_id(&letter.event.correlation_id)
                .with_timestamp(letter.failed_at),
            Err(e) => {
                warn!("Could not build event.failed for {}: {}", letter.event.correlation_id, e);
                return;
            }
        };
        if let Err(e) = self.publish(failed).await {
            warn!("Could not publish event.failed for {}: {}", letter.event.correlation_id, e);
        }
    }
}

pub fn debug_event(prefix: &str, event: &Event) {
    match event.event_type {
        EventType::SessionCreated | EventType::SessionEnded | EventType::DataSync => {
            trace!("{} Event: {:?}", prefix, event)
        }
        _ => debug!("{} Event: {:?}", prefix, event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        event::{
            handler::{FnHandler, MockEventHandler},
            payload::ChatMessagePayload,
        },
    };
    use serde_json::json;
    use std::{
        sync::atomic::{AtomicU32, AtomicUsize},
        time::Duration,
    };

    fn chat_event(session_id: &str) -> Event {
        Event::new(
            EventType::ChatMessage,
            session_id,
            json!({"platform": "discord", "user_id": "u1", "message_text": "hi"}),
        )
    }

    fn config(max_attempts: u32, threshold: u32) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.dispatch.max_attempts = max_attempts;
        config.dispatch.base_backoff = Duration::from_millis(100);
        config.dispatch.max_jitter = Duration::ZERO;
        config.dispatch.handler_timeout = Duration::from_millis(200);
        config.circuit_breaker.failure_threshold = threshold;
        config.circuit_breaker.cool_down_duration = Duration::from_secs(30);
        config
    }

    fn counting_handler(id: &str, calls: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        FnHandler::arc(id, move |_event: Event| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_accepted() {
        let bus = EventBus::new(&config(3, 3));
        let delivery = bus.publish(chat_event("s1")).await.unwrap();
        assert_eq!(delivery.subscriber_count(), 0);
        assert!(delivery.join().await.is_empty());
    }

    #[tokio::test]
    async fn test_schema_error_is_returned_to_producer() {
        let bus = EventBus::new(&config(3, 3));
        let calls = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::ChatMessage, counting_handler("h", calls.clone()))
            .await;

        let bad = Event::new(EventType::ChatMessage, "s1", json!({"platform": "discord"}));
        let result = bus.publish(bad).await;
        assert!(matches!(
            result,
            Err(EventError::Schema(SchemaError::MissingField { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.pending_retries().await, 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = EventBus::new(&config(3, 3));
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::ChatMessage, counting_handler("a", a.clone()))
            .await;
        bus.subscribe(EventType::ChatMessage, counting_handler("b", b.clone()))
            .await;

        let outcomes = bus.publish(chat_event("s1")).await.unwrap().join().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|(_, outcome)| *outcome == DispatchOutcome::Delivered));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_is_noop() {
        let bus = EventBus::new(&config(3, 3));
        let calls = Arc::new(AtomicUsize::new(0));
        let first = bus
            .subscribe(EventType::ChatMessage, counting_handler("h", calls.clone()))
            .await;
        let second = bus
            .subscribe(EventType::ChatMessage, counting_handler("h", calls.clone()))
            .await;
        assert_eq!(first, second);
        assert_eq!(bus.subscriber_count(&EventType::ChatMessage).await, 1);

        bus.publish(chat_event("s1")).await.unwrap().join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new(&config(3, 3));
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = bus
            .subscribe(EventType::ChatMessage, counting_handler("h", calls.clone()))
            .await;
        bus.unsubscribe(&handle).await.unwrap();
        assert_eq!(bus.subscriber_count(&EventType::ChatMessage).await, 0);
        assert!(matches!(
            bus.unsubscribe(&handle).await,
            Err(EventError::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let clock = ManualClock::default();
        let bus = EventBus::with_clock(&config(3, 5), Arc::new(clock.clone()));
        bus.subscribe(
            EventType::ChatMessage,
            FnHandler::arc("flaky", |_event: Event| async {
                Err(HandlerError::retryable("db unavailable"))
            }),
        )
        .await;

        let outcomes = bus.publish(chat_event("s1")).await.unwrap().join().await;
        let expected_at = clock.now() + chrono::TimeDelta::milliseconds(100);
        assert_eq!(
            outcomes,
            vec![(
                "flaky".to_string(),
                DispatchOutcome::Scheduled {
                    next_attempt_at: expected_at
                }
            )]
        );

        let items = bus.retry_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts_made, 1);
        assert_eq!(items[0].event.attempt, 1);

        // not yet due
        assert_eq!(bus.process_due_retries().await, 0);
        clock.advance(Duration::from_millis(100));
        assert_eq!(bus.process_due_retries().await, 1);

        let items = bus.retry_items().await;
        assert_eq!(items[0].attempts_made, 2);
        assert_eq!(
            items[0].next_attempt_at,
            clock.now() + chrono::TimeDelta::milliseconds(200)
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable_failure() {
        let bus = EventBus::new(&config(2, 5));
        bus.subscribe(
            EventType::ChatMessage,
            FnHandler::arc("slow", |_event: Event| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .await;

        let outcomes = bus.publish(chat_event("s1")).await.unwrap().join().await;
        assert!(matches!(outcomes[0].1, DispatchOutcome::Scheduled { .. }));
        let items = bus.retry_items().await;
        assert!(items[0].history[0].error.contains("timed out"));
        assert_eq!(bus.breaker_snapshot("slow").unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let bus = EventBus::new(&config(1, 5));
        bus.subscribe(
            EventType::ChatMessage,
            FnHandler::arc("panicky", |event: Event| async move {
                if event.attempt == 0 {
                    panic!("handler bug");
                }
                Ok(())
            }),
        )
        .await;

        let outcomes = bus.publish(chat_event("s1")).await.unwrap().join().await;
        assert_eq!(
            outcomes[0].1,
            DispatchOutcome::DeadLettered {
                reason: FailureReason::Exhausted
            }
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_reports_event_failed() {
        let bus = EventBus::new(&config(5, 1));
        let mut mock = MockEventHandler::new();
        mock.expect_id().return_const("strict".to_string());
        mock.expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::permanent("unsupported platform")));
        bus.subscribe(EventType::ChatMessage, Arc::new(mock)).await;

        let failures = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sink = failures.clone();
        bus.subscribe(
            EventType::EventFailed,
            FnHandler::arc("alerts", move |event: Event| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.push(event);
                    Ok(())
                }
            }),
        )
        .await;

        let event = chat_event("s1");
        let correlation_id = event.correlation_id.clone();
        let outcomes = bus.publish(event).await.unwrap().join().await;
        assert_eq!(
            outcomes[0].1,
            DispatchOutcome::DeadLettered {
                reason: FailureReason::Permanent
            }
        );
        assert_eq!(bus.pending_retries().await, 0);
        // threshold is 1, yet a permanent error leaves the breaker closed
        assert_eq!(bus.breaker_snapshot("strict").unwrap().state, CircuitState::Closed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let failures = failures.lock().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].correlation_id, correlation_id);
        let payload: crate::event::payload::EventFailedPayload = failures[0].payload_as().unwrap();
        assert_eq!(payload.reason, FailureReason::Permanent);
        assert_eq!(payload.destination, "strict");
        assert_eq!(payload.error, "unsupported platform");
    }

    #[tokio::test]
    async fn test_failing_event_failed_handler_is_not_republished() {
        let bus = EventBus::new(&config(1, 5));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        bus.subscribe(
            EventType::EventFailed,
            FnHandler::arc("alerts", move |_event: Event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::retryable("pager down"))
                }
            }),
        )
        .await;
        bus.subscribe(
            EventType::ChatMessage,
            FnHandler::arc("broken", |_event: Event| async {
                Err(HandlerError::retryable("nope"))
            }),
        )
        .await;

        bus.publish(chat_event("s1")).await.unwrap().join().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.dead_letters().await.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_payload() {
        let bus = EventBus::new(&config(3, 3));
        let received = Arc::new(tokio::sync::Mutex::new(None));
        let slot = received.clone();
        bus.subscribe(
            EventType::ChatMessage,
            FnHandler::arc("typed", move |event: Event| {
                let slot = slot.clone();
                async move {
                    let payload: ChatMessagePayload = event
                        .payload_as()
                        .map_err(|e| HandlerError::permanent(e.to_string()))?;
                    *slot.lock().await = Some(payload.message_text);
                    Ok(())
                }
            }),
        )
        .await;

        let payload = ChatMessagePayload {
            platform: "telegram".to_string(),
            user_id: "u2".to_string(),
            message_text: "index funds?".to_string(),
            metadata: Default::default(),
        };
        bus.publish_payload("s2", &payload)
            .await
            .unwrap()
            .join()
            .await;
        assert_eq!(received.lock().await.as_deref(), Some("index funds?"));
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let bus = EventBus::init(&config(3, 3)).await;
        assert!(bus.is_running());
        bus.shutdown().await;
        assert!(matches!(
            bus.publish(chat_event("s1")).await,
            Err(EventError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_payload_as_rejects_other_type() {
        let event = chat_event("s1");
        let result: EventResult<crate::event::payload::SessionCreatedPayload> = event.payload_as();
        assert!(matches!(result, Err(EventError::InvalidPayload { .. })));
    }
}
