//! Cloud connection session.
//!
//! The session owns at most one live cloud link at a time and drives its
//! lifecycle: connect (cancellable), twin seeding, telemetry forwarding,
//! inbound event pumping, reconnect after link loss, and orderly
//! disconnect. Stale work is fenced with an attempt counter: cancel,
//! disconnect, and every new connect bump it, and any task or late await
//! still carrying an older token discards itself.

use crate::cloud::{
    CloudConnector, CloudEvent, CloudTwinClient, Credentials, PROPERTY_COMPONENT,
    TELEMETRY_COMPONENT,
};
use crate::error::{AgentError, Result};
use crate::eventlog::EventLog;
use crate::sensors::{EventKind, SensorRegistry};
use crate::twin::commands::CommandRouter;
use crate::twin::properties::{PropertyStore, PropertyUplink};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

struct Link {
    client: Arc<dyn CloudTwinClient>,
    listener_tokens: Vec<crate::sensors::ListenerToken>,
    forward: JoinHandle<()>,
    pump: JoinHandle<()>,
}

pub struct ConnectionSession {
    connector: Arc<dyn CloudConnector>,
    registry: Arc<SensorRegistry>,
    store: Arc<PropertyStore>,
    router: Arc<CommandRouter>,
    events: Arc<EventLog>,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<String>>,
    credentials: Mutex<Option<Credentials>>,
    link: Mutex<Option<Link>>,
    attempt: AtomicU64,
    reconnect_backoff: Duration,
}

impl ConnectionSession {
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        registry: Arc<SensorRegistry>,
        store: Arc<PropertyStore>,
        router: Arc<CommandRouter>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            connector,
            registry,
            store,
            router,
            events,
            state: Mutex::new(SessionState::Disconnected),
            last_error: Mutex::new(None),
            credentials: Mutex::new(None),
            link: Mutex::new(None),
            attempt: AtomicU64::new(0),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    /// Override the pause between reconnect attempts.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.lock().is_some()
    }

    /// Most recent connection-level failure, kept for diagnostics until the
    /// next successful connect.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Connect to the cloud with the given credentials and bring the link
    /// up: twin fetch and seed, reported-state reconciliation, telemetry
    /// forwarding, event pump. Calling while an earlier connect is still in
    /// flight supersedes it, as [`Self::cancel`] would; the superseded
    /// attempt (and any cancelled one) resolves to
    /// [`AgentError::ConnectCancelled`] and its late connection is
    /// discarded.
    pub async fn connect(self: &Arc<Self>, credentials: Credentials) -> Result<()> {
        let token = {
            let mut state = self.state.lock();
            match *state {
                SessionState::Connected | SessionState::Reconnecting => {
                    return Err(AgentError::ConnectionFailed(
                        "session is already connected".into(),
                    ));
                }
                SessionState::Connecting => {
                    info!("[Session] New connect supersedes the in-flight attempt");
                }
                SessionState::Disconnected | SessionState::Error => {}
            }
            *state = SessionState::Connecting;
            // Claimed under the state lock, so a cancel observing
            // `Connecting` always bumps the counter after this claim and
            // reliably invalidates the token.
            self.attempt.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!("[Session] Connecting as {}", credentials.device_id);
        // Kept through failure too, so an errored attempt stays inspectable.
        *self.credentials.lock() = Some(credentials.clone());

        let connected = self.connector.connect(&credentials).await;

        if self.attempt.load(Ordering::SeqCst) != token {
            // Cancelled (or superseded) while the connect was in flight; a
            // late successful connection must not leak.
            if let Ok(client) = connected {
                tokio::spawn(async move { client.shutdown().await });
            }
            debug!("[Session] Discarding stale connection attempt {}", token);
            return Err(AgentError::ConnectCancelled);
        }

        let client = match connected {
            Ok(client) => client,
            Err(e) => {
                *self.state.lock() = SessionState::Error;
                *self.last_error.lock() = Some(e.to_string());
                self.events.error(format!("Connection failed: {}", e));
                return Err(e);
            }
        };

        if let Err(e) = self.start_link(client, token).await {
            *self.state.lock() = SessionState::Error;
            *self.last_error.lock() = Some(e.to_string());
            self.events.error(format!("Link setup failed: {}", e));
            return Err(e);
        }

        *self.state.lock() = SessionState::Connected;
        *self.last_error.lock() = None;
        self.events.info("Connected to cloud");
        Ok(())
    }

    /// Abort an in-flight or failed connection attempt. Returns whether
    /// anything was cancelled; a connected session is left untouched.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SessionState::Connecting | SessionState::Error => {
                self.attempt.fetch_add(1, Ordering::SeqCst);
                *state = SessionState::Disconnected;
                info!("[Session] Connection attempt cancelled");
                true
            }
            _ => false,
        }
    }

    /// Tear the session down: detach sensor listeners, stop the pump and
    /// forwarder, close the cloud connection, and only then forget the
    /// credentials.
    pub async fn disconnect(&self) {
        self.attempt.fetch_add(1, Ordering::SeqCst);
        let link = self.link.lock().take();
        if let Some(link) = link {
            for token in &link.listener_tokens {
                self.registry.remove_listener(token);
            }
            link.forward.abort();
            link.pump.abort();
            link.client.shutdown().await;
        }
        // Credentials outlive the connection so a shutdown in progress can
        // still identify itself; they are cleared last.
        *self.credentials.lock() = None;
        *self.state.lock() = SessionState::Disconnected;
        self.events.info("Disconnected from cloud");
    }

    /// Bring up everything that rides on a freshly connected client.
    async fn start_link(self: &Arc<Self>, client: Arc<dyn CloudTwinClient>, token: u64) -> Result<()> {
        let twin = client
            .fetch_twin()
            .await
            .map_err(|e| AgentError::TwinFetchFailed(e.to_string()))?;
        self.store.seed_from_twin(&twin);
        client.send_property(self.store.reported_patch()).await?;

        // Listener handlers run on sensor pump tasks; they hand samples off
        // without blocking and drop them when the forwarder is behind.
        let (sample_tx, mut sample_rx) = mpsc::channel::<(String, Value)>(64);
        let mut listener_tokens = Vec::with_capacity(self.registry.len());
        for sensor in self.registry.sensors() {
            let tx = sample_tx.clone();
            listener_tokens.push(self.registry.add_listener(
                sensor.id(),
                EventKind::DataAvailable,
                Arc::new(move |sensor_id, reading| {
                    let value = serde_json::to_value(reading).unwrap_or(Value::Null);
                    let _ = tx.try_send((sensor_id.to_string(), value));
                }),
            ));
        }

        let forward = {
            let weak = Arc::downgrade(self);
            let client = client.clone();
            tokio::spawn(async move {
                while let Some((sensor_id, value)) = sample_rx.recv().await {
                    let Some(session) = weak.upgrade() else { return };
                    if session.state() != SessionState::Connected {
                        continue;
                    }
                    let mut fields = Map::new();
                    fields.insert(sensor_id.clone(), value);
                    if let Err(e) = client.send_telemetry(fields, TELEMETRY_COMPONENT).await {
                        warn!("[Session] Telemetry for {} not sent: {}", sensor_id, e);
                    }
                }
            })
        };

        let pump = {
            let weak = Arc::downgrade(self);
            let client = client.clone();
            let router = self.router.clone();
            let store = self.store.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                loop {
                    match client.next_event().await {
                        Some(CloudEvent::Command(request)) => {
                            let name = request.name.clone();
                            if let Err(e) = router.handle(request).await {
                                warn!("[Session] Command {} failed: {}", name, e);
                            }
                        }
                        Some(CloudEvent::Property(update)) => {
                            match store.apply_cloud_update(&update.name, &update.value) {
                                Ok((name, value)) => {
                                    if let Err(e) = update.ack(&name, &value) {
                                        warn!("[Session] Property ack for {} lost: {}", name, e);
                                    }
                                }
                                Err(e) => {
                                    events.error(format!("Property update rejected: {}", e));
                                }
                            }
                        }
                        None => {
                            let Some(session) = weak.upgrade() else { return };
                            if session.attempt.load(Ordering::SeqCst) != token {
                                return;
                            }
                            warn!("[Session] Cloud connection lost");
                            session.events.error("Cloud connection lost");
                            *session.last_error.lock() = Some("connection lost".to_string());
                            *session.state.lock() = SessionState::Reconnecting;
                            session.detach_link();
                            tokio::spawn(session.clone().resume(token));
                            return;
                        }
                    }
                }
            })
        };

        *self.link.lock() = Some(Link {
            client,
            listener_tokens,
            forward,
            pump,
        });
        Ok(())
    }

    /// Detach listeners and stop the forwarder after link loss. The pump is
    /// the caller and exits on its own.
    fn detach_link(&self) {
        if let Some(link) = self.link.lock().take() {
            for token in &link.listener_tokens {
                self.registry.remove_listener(token);
            }
            link.forward.abort();
        }
    }

    /// Reconnect loop after link loss. Boxed so the pump task it respawns
    /// can name its own future type. Gives up as soon as the attempt token
    /// is superseded by cancel, disconnect, or a fresh connect.
    fn resume(self: Arc<Self>, token: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            loop {
                tokio::time::sleep(self.reconnect_backoff).await;
                if self.attempt.load(Ordering::SeqCst) != token {
                    return;
                }
                let Some(credentials) = self.credentials.lock().clone() else {
                    return;
                };
                match self.connector.connect(&credentials).await {
                    Ok(client) => {
                        if self.attempt.load(Ordering::SeqCst) != token {
                            tokio::spawn(async move { client.shutdown().await });
                            return;
                        }
                        match self.start_link(client, token).await {
                            Ok(()) => {
                                *self.state.lock() = SessionState::Connected;
                                *self.last_error.lock() = None;
                                self.events.info("Reconnected to cloud");
                                return;
                            }
                            Err(e) => warn!("[Session] Relink failed: {}", e),
                        }
                    }
                    Err(e) => warn!("[Session] Reconnect failed: {}", e),
                }
            }
        })
    }
}

#[async_trait]
impl PropertyUplink for ConnectionSession {
    /// Upload a reported-property patch through the live link, wrapped in
    /// the twin's property component.
    async fn upload_property(&self, patch: Value) -> Result<()> {
        let client = self
            .link
            .lock()
            .as_ref()
            .map(|link| link.client.clone())
            .ok_or(AgentError::NotConnected)?;

        let mut component = Map::new();
        component.insert("__t".to_string(), Value::String("c".to_string()));
        if let Value::Object(map) = patch {
            for (key, value) in map {
                component.insert(key, value);
            }
        }
        client.send_property(json!({ PROPERTY_COMPONENT: component })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PulseActuator;
    use crate::cloud::{CommandStatus, LoopbackHub};
    use crate::sensors::ids;
    use serde_json::json;
    use tokio::time::sleep;

    fn session_with(connector: Arc<dyn CloudConnector>) -> Arc<ConnectionSession> {
        let registry = Arc::new(SensorRegistry::with_standard_fleet(
            Duration::from_millis(20),
            true,
        ));
        let store = Arc::new(PropertyStore::new());
        let events = Arc::new(EventLog::new());
        let router = Arc::new(CommandRouter::new(
            registry.clone(),
            Arc::new(PulseActuator::new()),
            events.clone(),
        ));
        Arc::new(
            ConnectionSession::new(connector, registry, store, router, events)
                .with_reconnect_backoff(Duration::from_millis(30)),
        )
    }

    fn test_session(hub: &LoopbackHub) -> Arc<ConnectionSession> {
        session_with(Arc::new(hub.clone()))
    }

    /// Connector that parks every connect until released, so tests can
    /// interleave session calls with a connect deterministically.
    struct GatedConnector {
        hub: LoopbackHub,
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl CloudConnector for GatedConnector {
        async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn CloudTwinClient>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.hub.connect(credentials).await
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            device_id: "dev-1".into(),
            scope_id: Some("0ne000".into()),
            device_key: Some("key".into()),
            connection_string: None,
        }
    }

    #[tokio::test]
    async fn test_connect_attaches_one_listener_per_sensor() {
        let hub = LoopbackHub::new();
        let session = test_session(&hub);

        session.connect(credentials()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(hub.is_device_connected());
        assert_eq!(session.registry.listener_count(), session.registry.len());
    }

    #[tokio::test]
    async fn test_enabled_sensor_telemetry_reaches_the_hub() {
        let hub = LoopbackHub::new();
        let session = test_session(&hub);
        session.connect(credentials()).await.unwrap();

        let sensor = session.registry.sensor(ids::BAROMETER).unwrap();
        sensor.enable(true).unwrap();
        sleep(Duration::from_millis(120)).await;

        let telemetry = hub.telemetry_received();
        assert!(!telemetry.is_empty());
        let (fields, tag) = &telemetry[0];
        assert!(fields.contains_key(ids::BAROMETER));
        assert_eq!(tag, TELEMETRY_COMPONENT);
    }

    #[tokio::test]
    async fn test_pushed_command_is_routed_and_replied() {
        let hub = LoopbackHub::new();
        let session = test_session(&hub);
        session.connect(credentials()).await.unwrap();

        let reply_rx = hub
            .push_command("enableSensors", r#"{"sensor":"battery","enable":true}"#)
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_millis(500), reply_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.status, CommandStatus::Success);
        assert!(session.registry.sensor(ids::BATTERY).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_pushed_property_is_applied_and_acked() {
        let hub = LoopbackHub::new();
        let session = test_session(&hub);
        session.connect(credentials()).await.unwrap();

        let ack_rx = hub
            .push_property("settings", json!({"__t": "c", "fanSpeed": 3}))
            .unwrap();
        let ack = tokio::time::timeout(Duration::from_millis(500), ack_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.name, "fanSpeed");
        assert_eq!(ack.value, json!(3));
        assert_eq!(session.store.get("fanSpeed").unwrap().value, json!(3));
    }

    #[tokio::test]
    async fn test_failed_connect_enters_error_state() {
        let hub = LoopbackHub::new();
        hub.set_fail_connect(true);
        let session = test_session(&hub);

        assert!(session.connect(credentials()).await.is_err());
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.last_error().is_some());
        // The failed attempt stays inspectable until cancelled.
        assert!(session.has_credentials());
        assert!(session.cancel());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_connect() {
        let hub = LoopbackHub::new();
        hub.set_connect_delay(Duration::from_millis(100));
        let session = test_session(&hub);

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(credentials()).await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(session.cancel());

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(AgentError::ConnectCancelled)));
        assert_eq!(session.state(), SessionState::Disconnected);

        // The late connection is shut down, not leaked.
        sleep(Duration::from_millis(150)).await;
        assert!(!hub.is_device_connected());
    }

    #[tokio::test]
    async fn test_new_connect_supersedes_in_flight_attempt() {
        let hub = LoopbackHub::new();
        hub.set_connect_delay(Duration::from_millis(100));
        let session = test_session(&hub);

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(credentials()).await })
        };
        sleep(Duration::from_millis(20)).await;
        assert_eq!(session.state(), SessionState::Connecting);

        // Second connect while the first is still in flight: the first is
        // implicitly cancelled and the second proceeds.
        hub.set_connect_delay(Duration::ZERO);
        session.connect(credentials()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let result = first.await.unwrap();
        assert!(matches!(result, Err(AgentError::ConnectCancelled)));
    }

    #[tokio::test]
    async fn test_cancel_between_state_change_and_resolution_never_connects() {
        let hub = LoopbackHub::new();
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let session = session_with(Arc::new(GatedConnector {
            hub: hub.clone(),
            entered: entered.clone(),
            release: release.clone(),
        }));

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(credentials()).await })
        };

        // The attempt is provably past its state transition; cancel now,
        // then let the connect resolve.
        entered.notified().await;
        assert!(session.cancel());
        release.notify_one();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(AgentError::ConnectCancelled)));
        assert_eq!(session.state(), SessionState::Disconnected);

        sleep(Duration::from_millis(50)).await;
        assert!(!hub.is_device_connected());
    }

    #[tokio::test]
    async fn test_disconnect_detaches_listeners_then_clears_credentials() {
        let hub = LoopbackHub::new();
        let session = test_session(&hub);
        session.connect(credentials()).await.unwrap();
        assert!(session.has_credentials());

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.registry.listener_count(), 0);
        assert!(!session.has_credentials());
        assert!(!hub.is_device_connected());
    }

    #[tokio::test]
    async fn test_link_loss_triggers_reconnect() {
        let hub = LoopbackHub::new();
        let session = test_session(&hub);
        session.connect(credentials()).await.unwrap();

        hub.drop_connection();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(session.state(), SessionState::Connected);
        assert!(hub.is_device_connected());
        assert_eq!(session.registry.listener_count(), session.registry.len());
    }

    #[tokio::test]
    async fn test_local_write_flows_through_the_session() {
        let hub = LoopbackHub::new();
        let session = test_session(&hub);
        session.connect(credentials()).await.unwrap();

        session
            .store
            .write("brightness", json!(70), session.as_ref())
            .await
            .unwrap();

        let reported = hub.reported();
        let component = reported.get(PROPERTY_COMPONENT).unwrap();
        assert_eq!(component.get("brightness").unwrap(), &json!(70));
    }
}
