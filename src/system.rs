use std::sync::Arc;

use tracing::info;

use crate::{
    clock::{Clock, SystemClock},
    config::SystemConfig,
    event::{EventBus, EventRegistry},
    session::SessionManager,
    InternalResult,
};

/// Wires the event bus and the session manager together and owns their
/// background tasks.
pub struct System {
    config: SystemConfig,
    event_bus: EventBus,
    session_manager: Arc<SessionManager>,
}

impl System {
    /// Validates `config`, then starts the retry worker and the session sweeper.
    pub async fn init(config: SystemConfig) -> InternalResult<Self> {
        Self::init_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn init_with_clock(
        config: SystemConfig,
        clock: Arc<dyn Clock>,
    ) -> InternalResult<Self> {
        config.validate()?;

        let event_bus = EventBus::with_clock(&config, clock);
        event_bus.start().await;
        let session_manager = Arc::new(SessionManager::new(config.session, event_bus.clone()));
        session_manager.start().await;

        info!("System initialized");
        Ok(Self {
            config,
            event_bus,
            session_manager,
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn event_registry(&self) -> &EventRegistry {
        self.event_bus.registry()
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.session_manager.clone()
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Stops the sweeper before the bus so its last `session.ended` events
    /// can still be published.
    pub async fn shutdown(&self) -> InternalResult<()> {
        self.session_manager.stop().await;
        self.event_bus.shutdown().await;
        info!("System shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigError, event::EventError, Error};

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let mut config = SystemConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        let result = System::init(config).await;
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::Invalid { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let system = System::init(SystemConfig::default()).await.unwrap();
        assert!(system.event_bus().is_running());
        assert!(system.session_manager().is_running());
        assert!(system
            .event_registry()
            .contains_event(&crate::event::EventType::ChatMessage));

        system.shutdown().await.unwrap();
        assert!(!system.session_manager().is_running());
        let event = crate::event::Event::new(
            crate::event::EventType::DataSync,
            "s1",
            serde_json::json!({"entity_type": "product", "entity_id": "p1", "operation": "update"}),
        );
        assert!(matches!(
            system.event_bus().publish(event).await,
            Err(EventError::ShutDown)
        ));
    }
}
