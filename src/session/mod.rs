//! # Session Lifecycle
//!
//! Tracks per-user conversational context. A session belongs to one
//! `(user_id, platform)` pair, lives while the user keeps talking and is swept
//! away after `session_ttl` of silence.
//!
//! ```text
//!          getOrCreateSession              appendMessage
//!  (none) ────────────────────▶ ACTIVE ◀──────────────┐
//!      publishes session.created  │ └─────────────────┘
//!                                 │ idle > ttl (sweep) or end_session
//!                                 ▼
//!                              REMOVED ──▶ publishes session.ended
//! ```

pub mod manager;
pub mod model;

pub use manager::{SessionError, SessionManager, SessionResult};
pub use model::{
    ConversationMessage, MessageType, Session, SessionStats, SessionSummary, SessionValidity,
};
