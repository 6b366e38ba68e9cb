//! Shared agent context.
//!
//! One explicitly constructed object wires the fleet, property mirror,
//! command router, event log, and connection session together. Everything
//! that needs a collaborator receives it from here; there is no global
//! state anywhere in the crate.

use crate::actuator::Actuator;
use crate::cloud::{CloudConnector, Credentials};
use crate::config::Config;
use crate::error::Result;
use crate::eventlog::EventLog;
use crate::sensors::{DeliveryIntervalCoordinator, SensorRegistry};
use crate::twin::{CommandRouter, ConnectionSession, PropertyStore, SessionState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub struct AgentContext {
    pub config: Config,
    pub registry: Arc<SensorRegistry>,
    pub interval: Arc<DeliveryIntervalCoordinator>,
    pub store: Arc<PropertyStore>,
    pub events: Arc<EventLog>,
    pub session: Arc<ConnectionSession>,
}

impl AgentContext {
    /// Wire up a full agent from its three injectable seams: configuration,
    /// cloud connector, and actuator.
    pub fn new(
        config: Config,
        connector: Arc<dyn CloudConnector>,
        actuator: Arc<dyn Actuator>,
    ) -> Arc<Self> {
        let default_interval = Duration::from_millis(config.telemetry.default_interval_ms);
        let registry = Arc::new(SensorRegistry::with_standard_fleet(
            default_interval,
            config.telemetry.simulated,
        ));
        let interval = Arc::new(DeliveryIntervalCoordinator::new(
            registry.clone(),
            default_interval,
        ));
        let store = Arc::new(PropertyStore::new());
        let events = Arc::new(EventLog::new());
        let router = Arc::new(CommandRouter::new(
            registry.clone(),
            actuator,
            events.clone(),
        ));
        let session = Arc::new(ConnectionSession::new(
            connector,
            registry.clone(),
            store.clone(),
            router,
            events.clone(),
        ));

        Arc::new(Self {
            config,
            registry,
            interval,
            store,
            events,
            session,
        })
    }

    /// Connect using the credentials carried in the configuration.
    pub async fn connect_from_config(&self) -> Result<()> {
        let credentials = Credentials::from_device_config(&self.config.device)?;
        self.session.connect(credentials).await
    }

    /// Write a twin property on behalf of the local operator; the session
    /// uploads it and the store tracks the pending state.
    pub async fn write_property(&self, id: &str, value: Value) -> Result<()> {
        self.store.write(id, value, self.session.as_ref()).await
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PulseActuator;
    use crate::cloud::LoopbackHub;
    use serde_json::json;

    fn test_context(hub: &LoopbackHub) -> Arc<AgentContext> {
        AgentContext::new(
            Config::default(),
            Arc::new(hub.clone()),
            Arc::new(PulseActuator::new()),
        )
    }

    #[tokio::test]
    async fn test_context_wires_the_standard_fleet() {
        let hub = LoopbackHub::new();
        let context = test_context(&hub);

        assert_eq!(context.registry.len(), 6);
        assert_eq!(context.session_state(), SessionState::Disconnected);
        assert!(context.registry.sensors().all(|s| !s.is_enabled()));
    }

    #[tokio::test]
    async fn test_property_write_round_trip() {
        let hub = LoopbackHub::new();
        let context = test_context(&hub);
        context.connect_from_config().await.unwrap();

        context.write_property("fanSpeed", json!(2)).await.unwrap();
        assert!(hub.reported().contains_key("settings"));
    }
}
