//! # Event-Driven Architecture
//!
//! Every component of the recommendation pipeline (chat adapters, intent
//! analysis, response generation, store synchronisation) talks to the others
//! only through events. Producers never know who consumes what they publish.
//!
//! ## Architecture Overview
//!
//! - **EventRegistry**: known event types and their payload shapes; validates every
//!   event before it is admitted
//! - **EventBus**: routes each event to its subscribers, one isolated dispatch per
//!   subscriber
//! - **CircuitBreaker**: per-destination gate that stops hammering a failing handler
//! - **RetryQueue / DeadLetterSink**: backoff-driven redelivery and the record of
//!   deliveries that gave up
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────┐     ┌──────────┐     ┌────────────┐     ┌──────────┐
//! │Publisher │────▶│ Registry │────▶│  EventBus  │────▶│Subscriber│
//! └──────────┘     └──────────┘     └─────┬──────┘     └──────────┘
//!                                         │ failure
//!                                   ┌─────▼──────┐     ┌────────────┐
//!                                   │ RetryQueue │────▶│ DeadLetter │──▶ event.failed
//!                                   └────────────┘     └────────────┘
//! ```
//!
//! ## Usage Examples
//!
//! ### Subscribing and Publishing
//!
//! ```rust,no_run
//! # use finrec::config::SystemConfig;
//! # use finrec::event::{EventBus, EventType, FnHandler, payload::ChatMessagePayload};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = EventBus::init(&SystemConfig::default()).await;
//!
//! bus.subscribe(
//!     EventType::ChatMessage,
//!     FnHandler::arc("intent-analyzer", |event| async move {
//!         println!("analyzing {}", event.correlation_id);
//!         Ok(())
//!     }),
//! )
//! .await;
//!
//! let payload = ChatMessagePayload {
//!     platform: "discord".to_string(),
//!     user_id: "u1".to_string(),
//!     message_text: "Is now a good time to buy bonds?".to_string(),
//!     metadata: Default::default(),
//! };
//! bus.publish_payload("discord_u1_0f3a", &payload).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Custom Event Types
//!
//! ```rust,no_run
//! # use finrec::event::{EventRegistry, ParameterType};
//! # use std::collections::HashMap;
//! let registry = EventRegistry::new();
//! registry
//!     .register_custom_event(
//!         "portfolio.rebalanced",
//!         HashMap::from([("portfolio_id".to_string(), ParameterType::String)]),
//!     )
//!     .unwrap();
//! ```

pub mod circuit_breaker;
pub mod delivery_queue;
pub mod event_bus;
pub mod event_registry;
pub mod handler;
pub mod payload;

pub use circuit_breaker::{BreakerPermit, CircuitBreakerState, CircuitState};
pub use delivery_queue::{AttemptRecord, DeadLetter, QueueItem};
pub use event_bus::{
    Delivery, DispatchOutcome, Event, EventBus, EventError, EventResult, SubscriptionHandle,
};
pub use event_registry::{EventInfo, EventRegistry, EventType, ParameterType, SchemaError};
pub use handler::{EventHandler, FnHandler, HandlerError, HandlerResult};
pub use payload::{EventPayload, FailureReason, SessionEndReason};
