use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::model::{
    ConversationMessage, Session, SessionStats, SessionSummary, SessionValidity,
};
use crate::{
    clock::Clock,
    config::SessionConfig,
    event::{
        payload::{SessionCreatedPayload, SessionEndReason, SessionEndedPayload},
        Event, EventBus, EventPayload,
    },
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },
    #[error("Session expired: {session_id}")]
    Expired { session_id: String },
}

pub type SessionResult<T> = Result<T, SessionError>;

type SessionRef = Arc<Mutex<Session>>;

/// # SessionManager
///
/// Owns every active session. The set itself is a concurrent map; each session
/// sits behind its own lock so writers to different sessions never contend.
///
/// Lock order is `user_index` entry, then session lock. Events are published
/// only after every lock has been released.
pub struct SessionManager {
    sessions: DashMap<String, SessionRef>,
    /// (user_id, platform) -> session_id of the pair's current session
    user_index: DashMap<(String, String), String>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    running: AtomicBool,
    stop_signal: Notify,
    task_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Sessions are timed by the bus's clock.
    pub fn new(config: SessionConfig, event_bus: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            user_index: DashMap::new(),
            clock: event_bus.clock(),
            event_bus,
            config,
            running: AtomicBool::new(false),
            stop_signal: Notify::new(),
            task_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the pair's live session, or starts a new one and announces it
    /// with `session.created`. A session past its TTL is replaced even if the
    /// sweep has not reached it yet.
    #[instrument(skip(self))]
    pub async fn get_or_create_session(&self, user_id: &str, platform: &str) -> Session {
        let now = self.clock.now();
        let mut replaced = None;

        let (session, created) = match self
            .user_index
            .entry((user_id.to_string(), platform.to_string()))
        {
            Entry::Occupied(mut entry) => {
                let live = self
                    .sessions
                    .get(entry.get())
                    .map(|s| s.value().clone())
                    .map(|s| lock(&s).clone())
                    .filter(|s| !s.is_expired(now));
                match live {
                    Some(session) => (session, false),
                    None => {
                        let stale_id = entry.get().clone();
                        replaced = self
                            .sessions
                            .remove_if(&stale_id, |_, s| lock(s).is_expired(now))
                            .map(|(_, s)| lock(&s).clone());
                        let session = self.insert_new(user_id, platform, now);
                        entry.insert(session.session_id.clone());
                        (session, true)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let session = self.insert_new(user_id, platform, now);
                entry.insert(session.session_id.clone());
                (session, true)
            }
        };

        if let Some(stale) = replaced {
            info!("Session {} expired before sweep, replaced", stale.session_id);
            self.publish_ended(&stale, now, SessionEndReason::Expired).await;
        }
        if created {
            self.publish_created(&session).await;
        }
        session
    }

    fn insert_new(&self, user_id: &str, platform: &str, now: DateTime<Utc>) -> Session {
        let session = Session::new(user_id, platform, now, self.config.session_ttl);
        self.sessions.insert(
            session.session_id.clone(),
            Arc::new(Mutex::new(session.clone())),
        );
        info!(
            "Created session {} for user {} on {}",
            session.session_id, user_id, platform
        );
        session
    }

    /// Appends `message` and bumps the session's activity. Appends to one
    /// session are totally ordered by lock acquisition.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn append_message(
        &self,
        session_id: &str,
        message: ConversationMessage,
    ) -> SessionResult<()> {
        self.with_live_session(session_id, |session, now| {
            session.messages.push(message);
            session.touch(now);
        })
    }

    pub async fn set_context(
        &self,
        session_id: &str,
        key: &str,
        value: JsonValue,
    ) -> SessionResult<()> {
        self.with_live_session(session_id, |session, now| {
            session.context.insert(key.to_string(), value);
            session.touch(now);
        })
    }

    pub fn validate_session(&self, session_id: &str) -> SessionValidity {
        match self.session_ref(session_id) {
            None => SessionValidity::NotFound,
            Some(session) if lock(&session).is_expired(self.clock.now()) => {
                SessionValidity::Expired
            }
            Some(_) => SessionValidity::Valid,
        }
    }

    /// Clears messages and context; the identifier and timestamps are kept.
    #[instrument(skip(self))]
    pub async fn reset_session(&self, session_id: &str) -> SessionResult<()> {
        let session = self
            .session_ref(session_id)
            .ok_or_else(|| not_found(session_id))?;
        let mut session = lock(&session);
        session.messages.clear();
        session.context.clear();
        debug!("Reset session {}", session_id);
        Ok(())
    }

    /// Removes the session on request and publishes `session.ended`.
    #[instrument(skip(self))]
    pub async fn end_session(&self, session_id: &str) -> SessionResult<()> {
        let now = self.clock.now();
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| not_found(session_id))?;
        let session = lock(&session).clone();
        self.unindex(&session);
        info!("Ended session {}", session_id);
        self.publish_ended(&session, now, SessionEndReason::Ended).await;
        Ok(())
    }

    /// Removes every session idle for longer than its TTL and publishes one
    /// `session.ended` per removed session. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| lock(entry.value()).is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        // re-checked on removal: an append may have landed since the scan
        let removed: Vec<Session> = candidates
            .iter()
            .filter_map(|id| {
                self.sessions
                    .remove_if(id, |_, s| lock(s).is_expired(now))
                    .map(|(_, s)| lock(&s).clone())
            })
            .collect();

        for session in &removed {
            self.unindex(session);
            info!(
                "Cleaned up expired session {} (idle since {})",
                session.session_id, session.last_activity_at
            );
            self.publish_ended(session, now, SessionEndReason::Expired)
                .await;
        }
        if !removed.is_empty() {
            debug!("Session sweep removed {} sessions", removed.len());
        }
        removed.len()
    }

    pub fn get_stats(&self) -> SessionStats {
        let now = self.clock.now();
        let live: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| lock(entry.value()).clone())
            .filter(|s| !s.is_expired(now))
            .collect();
        if live.is_empty() {
            return SessionStats::default();
        }

        let count = live.len() as f64;
        let users: HashSet<&str> = live.iter().map(|s| s.user_id.as_str()).collect();
        SessionStats {
            active_sessions: live.len(),
            unique_users: users.len(),
            avg_duration: live
                .iter()
                .map(|s| s.duration(now).as_secs_f64())
                .sum::<f64>()
                / count,
            avg_messages_per_session: live.iter().map(|s| s.message_count() as f64).sum::<f64>()
                / count,
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.session_ref(session_id).map(|s| lock(&s).clone())
    }

    pub fn session_stats(&self, session_id: &str) -> SessionResult<SessionSummary> {
        self.get_session(session_id)
            .map(|s| s.summary(self.clock.now()))
            .ok_or_else(|| not_found(session_id))
    }

    /// Live sessions of `user_id` across every platform.
    pub fn user_sessions(&self, user_id: &str) -> Vec<Session> {
        let now = self.clock.now();
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| lock(entry.value()).clone())
            .filter(|s| s.user_id == user_id && !s.is_expired(now))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Starts the periodic expiry sweep.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.task_handle.lock().await;
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let manager = self.clone();
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        *handle = Some(tokio::spawn(async move {
            // the first tick completes immediately
            interval.tick().await;
            while manager.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.cleanup_expired().await;
                    }
                    _ = manager.stop_signal.notified() => break,
                }
            }
            debug!("Session sweeper stopped");
        }));
        info!(
            "Session manager started (ttl {:?}, sweep every {:?})",
            self.config.session_ttl, self.config.cleanup_interval
        );
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_signal.notify_one();
        if let Some(handle) = self.task_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Session sweeper ended abnormally: {}", e);
            }
        }
        info!("Session manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn session_ref(&self, session_id: &str) -> Option<SessionRef> {
        // clone out so the map shard is not held while the session is locked
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    fn with_live_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session, DateTime<Utc>) -> T,
    ) -> SessionResult<T> {
        let session = self
            .session_ref(session_id)
            .ok_or_else(|| not_found(session_id))?;
        let mut session = lock(&session);
        let now = self.clock.now();
        if session.is_expired(now) {
            return Err(SessionError::Expired {
                session_id: session_id.to_string(),
            });
        }
        Ok(f(&mut session, now))
    }

    fn unindex(&self, session: &Session) {
        self.user_index.remove_if(
            &(session.user_id.clone(), session.platform.clone()),
            |_, id| *id == session.session_id,
        );
    }

    async fn publish_created(&self, session: &Session) {
        let payload = SessionCreatedPayload {
            user_id: session.user_id.clone(),
            platform: session.platform.clone(),
        };
        self.publish(&session.session_id, &payload, session.created_at)
            .await;
    }

    async fn publish_ended(&self, session: &Session, now: DateTime<Utc>, reason: SessionEndReason) {
        let payload = SessionEndedPayload {
            user_id: session.user_id.clone(),
            platform: session.platform.clone(),
            duration: session.duration(now).as_secs_f64(),
            message_count: session.message_count() as u64,
            reason,
        };
        self.publish(&session.session_id, &payload, now).await;
    }

    async fn publish<P: EventPayload>(&self, session_id: &str, payload: &P, at: DateTime<Utc>) {
        let result = match Event::from_payload(session_id, payload) {
            Ok(event) => self.event_bus.publish(event.with_timestamp(at)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                "Failed to publish {} for session {}: {}",
                P::event_type(),
                session_id,
                e
            );
        }
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(session_id: &str) -> SessionError {
    SessionError::NotFound {
        session_id: session_id.to_string(),
    }
}
