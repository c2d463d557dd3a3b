//! # Circuit Breaker
//!
//! One breaker per destination (subscriber id). It gates whether a dispatch is
//! attempted at all:
//!
//! ```text
//!            failures >= threshold
//!  ┌────────┐ ───────────────────▶ ┌──────┐
//!  │ CLOSED │                      │ OPEN │◀──────────┐
//!  └────────┘ ◀──┐                 └──┬───┘           │
//!                │ trial ok           │ cool-down     │ trial failed
//!                │                 ┌──▼────────┐      │
//!                └──────────────── │ HALF_OPEN │ ─────┘
//!                                  └───────────┘
//! ```
//!
//! HALF_OPEN admits exactly one trial dispatch; every other attempt made while
//! the trial is in flight is rejected. Every admitted dispatch carries a
//! [`BreakerPermit`] stamped with the breaker's epoch, which advances on each
//! trip. Outcomes from an older epoch are ignored, and while HALF_OPEN only the
//! trial's outcome moves the state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::{clock::shift, config::CircuitBreakerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission ticket handed out by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPermit {
    epoch: u64,
    trial: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Point-in-time view of a destination's breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub cool_down_duration: Duration,
    /// Dispatches refused while open; these never count as failures
    pub rejected: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    epoch: u64,
    trial_in_flight: bool,
    rejected: u64,
    failure_threshold: u32,
    cool_down_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            epoch: 0,
            trial_in_flight: false,
            rejected: 0,
            failure_threshold: config.failure_threshold.max(1),
            cool_down_duration: config.cool_down_duration,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Earliest instant at which an OPEN breaker admits its trial.
    pub fn reopens_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CircuitState::Open => self
                .opened_at
                .map(|opened| shift(opened, self.cool_down_duration)),
            _ => None,
        }
    }

    /// Asks permission to dispatch. `None` means the call must be skipped.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Option<BreakerPermit> {
        match self.state {
            CircuitState::Closed => Some(self.permit(false)),
            CircuitState::Open => match self.reopens_at() {
                Some(at) if now >= at => {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Some(self.permit(true))
                }
                _ => {
                    self.rejected += 1;
                    None
                }
            },
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    self.rejected += 1;
                    None
                } else {
                    self.trial_in_flight = true;
                    Some(self.permit(true))
                }
            }
        }
    }

    fn permit(&self, trial: bool) -> BreakerPermit {
        BreakerPermit {
            epoch: self.epoch,
            trial,
        }
    }

    /// Whether an outcome reported under `permit` may change the state.
    fn decides(&self, permit: BreakerPermit) -> bool {
        if permit.epoch != self.epoch {
            return false;
        }
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => permit.trial,
            CircuitState::Open => false,
        }
    }

    /// Returns `false` when the outcome was stale and ignored.
    pub fn record_success(&mut self, permit: BreakerPermit) -> bool {
        if !self.decides(permit) {
            return false;
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
        true
    }

    /// Returns `false` when the outcome was stale and ignored.
    pub fn record_failure(&mut self, permit: BreakerPermit, now: DateTime<Utc>) -> bool {
        if !self.decides(permit) {
            return false;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::HalfOpen
            || self.consecutive_failures >= self.failure_threshold
        {
            self.trip(now);
        }
        true
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.epoch += 1;
        self.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
            failure_threshold: self.failure_threshold,
            cool_down_duration: self.cool_down_duration,
            rejected: self.rejected,
        }
    }
}

/// Breakers keyed by destination id. Each entry is mutated under its map shard
/// lock, so unrelated destinations rarely contend.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn try_acquire(&self, destination: &str, now: DateTime<Utc>) -> Option<BreakerPermit> {
        let mut breaker = self.entry(destination);
        let before = breaker.state();
        let permit = breaker.try_acquire(now);
        if before == CircuitState::Open && breaker.state() == CircuitState::HalfOpen {
            info!("Circuit half-open for {}, admitting trial dispatch", destination);
        }
        permit
    }

    pub fn record_success(&self, destination: &str, permit: BreakerPermit) {
        let mut breaker = self.entry(destination);
        let before = breaker.state();
        if !breaker.record_success(permit) {
            debug!("Ignoring stale success for {}", destination);
        } else if before == CircuitState::HalfOpen {
            info!("Circuit closed for {}", destination);
        }
    }

    pub fn record_failure(&self, destination: &str, permit: BreakerPermit, now: DateTime<Utc>) {
        let mut breaker = self.entry(destination);
        let before = breaker.state();
        if !breaker.record_failure(permit, now) {
            debug!("Ignoring stale failure for {}", destination);
        } else if before != CircuitState::Open && breaker.state() == CircuitState::Open {
            warn!(
                "Circuit opened for {} after {} consecutive failures",
                destination,
                breaker.snapshot().consecutive_failures
            );
        }
    }

    pub fn state(&self, destination: &str) -> Option<CircuitState> {
        self.breakers.get(destination).map(|breaker| breaker.state())
    }

    pub fn reopens_at(&self, destination: &str) -> Option<DateTime<Utc>> {
        self.breakers
            .get(destination)
            .and_then(|breaker| breaker.reopens_at())
    }

    pub fn snapshot(&self, destination: &str) -> Option<CircuitBreakerState> {
        self.breakers
            .get(destination)
            .map(|breaker| breaker.snapshot())
    }

    fn entry(&self, destination: &str) -> dashmap::mapref::one::RefMut<'_, String, CircuitBreaker> {
        self.breakers
            .entry(destination.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.config))
    }
}
