//! # finrec
//!
//! Event dispatch and session lifecycle core of a conversational financial
//! recommendation service.
//!
//! - [`event`]: validated publish/subscribe bus with per-destination circuit
//!   breakers, backoff retries and dead letters
//! - [`session`]: per-user conversational sessions with TTL expiry
//! - [`system`]: wires both together and owns their background tasks
//!
//! ```rust,no_run
//! # use finrec::{config::SystemConfig, session::ConversationMessage, System};
//! # async fn example() -> finrec::InternalResult<()> {
//! let system = System::init(SystemConfig::default()).await?;
//! let sessions = system.session_manager();
//!
//! let session = sessions.get_or_create_session("u1", "discord").await;
//! sessions
//!     .append_message(&session.session_id, ConversationMessage::user_query("hello"))
//!     .await?;
//!
//! system.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod system;

// Re-exports
pub use error::*;
pub use system::System;

#[cfg(test)]
#[ctor::ctor]
fn init_tests() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
