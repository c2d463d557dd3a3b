use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use mockall::automock;
use thiserror::Error;

use super::event_bus::Event;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Transient fault; the delivery is retried and counts against the breaker
    #[error("Handler fault: {0}")]
    Retryable(String),

    #[error("Handler {handler_id} timed out after {timeout_ms}ms")]
    Timeout { handler_id: String, timeout_ms: u64 },

    /// The handler can never accept this event (e.g. a payload it cannot use)
    #[error("Permanent handler error: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable<S: Into<String>>(message: S) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Permanent(_))
    }

    /// The handler's own wording, without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            HandlerError::Retryable(message) | HandlerError::Permanent(message) => message.clone(),
            timeout @ HandlerError::Timeout { .. } => timeout.to_string(),
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Anything that can consume an event. Identity is the value of [`id`](Self::id):
/// the bus keys subscriptions, circuit breakers and retries by it.
///
/// Implementations run under a deadline and may be dropped mid-flight when it
/// expires, so they must not leave shared state half-written across an await.
#[automock]
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn id(&self) -> String;

    async fn handle(&self, event: &Event) -> HandlerResult;
}

type HandlerFn = Box<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler {
    id: String,
    handler: HandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            id: id.into(),
            handler: Box::new(move |event| Box::pin(handler(event))),
        }
    }

    pub fn arc<F, Fut>(id: impl Into<String>, handler: F) -> Arc<dyn EventHandler>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Arc::new(Self::new(id, handler))
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn handle(&self, event: &Event) -> HandlerResult {
        (self.handler)(event.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_registry::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = FnHandler::new("counter", move |event: Event| {
            let counter = counter.clone();
            async move {
                assert_eq!(event.session_id, "s1");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let event = Event::new(EventType::ChatMessage, "s1", serde_json::json!({}));
        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        assert_eq!(handler.id(), "counter");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_classification() {
        assert!(HandlerError::retryable("db down").is_retryable());
        assert!(HandlerError::Timeout {
            handler_id: "h".to_string(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!HandlerError::permanent("bad payload").is_retryable());
        assert_eq!(HandlerError::permanent("bad payload").message(), "bad payload");
    }

    #[tokio::test]
    async fn test_mock_handler() {
        let mut mock = MockEventHandler::new();
        mock.expect_id().return_const("mocked".to_string());
        mock.expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::permanent("nope")));

        let event = Event::new(EventType::ChatMessage, "s1", serde_json::json!({}));
        assert_eq!(mock.id(), "mocked");
        assert!(matches!(
            mock.handle(&event).await,
            Err(HandlerError::Permanent(_))
        ));
    }
}
