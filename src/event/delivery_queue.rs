//! # Retrying Delivery Queue
//!
//! Failed (event, subscriber) deliveries wait here until their `next_attempt_at`.
//! Items are ordered by that instant and then by insertion, so two retries for
//! the same pair keep their enqueue order when they fall due together.
//!
//! Backoff is exponential with bounded jitter:
//!
//! ```text
//! delay(k) = min(base * 2^k + jitter, max_backoff),  jitter ∈ [0, max_jitter]
//! ```
//!
//! where `k` is the zero-based index of the attempt that just failed. An item
//! whose attempts are used up goes to the [`DeadLetterSink`] instead of back
//! into the queue.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

use super::{
    event_bus::Event,
    payload::{EventFailedPayload, FailureReason},
};
use crate::{clock::shift, config::DispatchConfig};

/// One failed dispatch, kept for the dead-letter report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based attempt index
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub event: Event,
    pub destination: String,
    pub next_attempt_at: DateTime<Utc>,
    /// Failed dispatches so far, the first one included
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub history: Vec<AttemptRecord>,
}

impl QueueItem {
    pub fn new(event: Event, destination: &str, max_attempts: u32) -> Self {
        let next_attempt_at = event.timestamp;
        Self {
            event,
            destination: destination.to_string(),
            next_attempt_at,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            history: Vec::new(),
        }
    }

    /// Records a failed attempt. Returns `true` once no attempts remain.
    pub fn record_failure(&mut self, at: DateTime<Utc>, error: &str) -> bool {
        self.history.push(AttemptRecord {
            attempt: self.event.attempt,
            at,
            error: error.to_string(),
        });
        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts);
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Prepares the item for its next attempt at `at`.
    pub fn schedule(&mut self, at: DateTime<Utc>) {
        self.next_attempt_at = at;
        self.event.attempt = self.attempts_made;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl Backoff {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            base: config.base_backoff,
            max: config.max_backoff,
            max_jitter: config.max_jitter,
        }
    }

    /// `base * 2^attempt`, saturating at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.base_delay(attempt)
            .saturating_add(jitter.min(self.max_jitter))
            .min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, self.jitter())
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Pending retries, earliest first.
#[derive(Debug, Default)]
pub struct RetryQueue {
    items: Mutex<BTreeMap<(DateTime<Utc>, u64), QueueItem>>,
    sequence: AtomicU64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, item: QueueItem) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.items
            .lock()
            .await
            .insert((item.next_attempt_at, seq), item);
    }

    /// Removes and returns every item due at `now`, in retry order.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<QueueItem> {
        self.pop_due_except(now, |_| false).await
    }

    /// Like [`pop_due`](Self::pop_due), but leaves queued every due item for
    /// which `skip` returns true. `skip` runs under the queue lock, in retry order.
    pub async fn pop_due_except<F>(&self, now: DateTime<Utc>, mut skip: F) -> Vec<QueueItem>
    where
        F: FnMut(&QueueItem) -> bool,
    {
        let mut items = self.items.lock().await;
        let keys: Vec<_> = items
            .iter()
            .take_while(|((at, _), _)| *at <= now)
            .filter(|(_, item)| !skip(*item))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter().filter_map(|key| items.remove(&key)).collect()
    }

    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.items
            .lock()
            .await
            .first_key_value()
            .map(|((at, _), _)| *at)
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn pending(&self) -> Vec<QueueItem> {
        self.items.lock().await.values().cloned().collect()
    }
}

/// A delivery that will never be attempted again.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub event: Event,
    pub destination: String,
    pub reason: FailureReason,
    pub error: String,
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_item(item: QueueItem, reason: FailureReason, failed_at: DateTime<Utc>) -> Self {
        let error = item
            .history
            .last()
            .map(|record| record.error.clone())
            .unwrap_or_default();
        Self {
            attempts: item.attempts_made,
            event: item.event,
            destination: item.destination,
            reason,
            error,
            history: item.history,
            failed_at,
        }
    }

    pub fn to_payload(&self) -> EventFailedPayload {
        EventFailedPayload {
            original_event_type: self.event.event_type.to_string(),
            original_correlation_id: self.event.correlation_id.clone(),
            destination: self.destination.clone(),
            reason: self.reason,
            error: self.error.clone(),
            attempts: self.attempts,
            history: self.history.clone(),
            original_payload: self.event.payload.clone(),
        }
    }
}

/// Bounded record of dead letters. Every letter is logged in full when recorded;
/// the oldest is evicted once capacity is reached.
#[derive(Debug)]
pub struct DeadLetterSink {
    letters: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, letter: DeadLetter) {
        let payload =
            serde_json::to_string(&letter.event.payload).unwrap_or_else(|e| e.to_string());
        let history =
            serde_json::to_string(&letter.history).unwrap_or_else(|e| e.to_string());
        error!(
            event_type = %letter.event.event_type,
            session_id = %letter.event.session_id,
            correlation_id = %letter.event.correlation_id,
            destination = %letter.destination,
            reason = %letter.reason,
            attempts = letter.attempts,
            "Dead letter: {} (payload: {}, history: {})",
            letter.error,
            payload,
            history
        );

        let mut letters = self.letters.lock().await;
        if letters.len() >= self.capacity {
            if let Some(evicted) = letters.pop_front() {
                warn!(
                    "Dead letter sink full, evicting {} for {}",
                    evicted.event.correlation_id, evicted.destination
                );
            }
        }
        letters.push_back(letter);
    }

    pub async fn snapshot(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }
}

pub(crate) fn schedule_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    shift(now, delay)
}
