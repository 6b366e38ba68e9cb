//! Cloud twin client capability.
//!
//! The synchronization engine treats the cloud SDK as an opaque async
//! collaborator: connect, send telemetry, patch reported properties, fetch
//! the twin, and receive command/property events with per-event
//! acknowledgement primitives. Two implementations ship here: an in-process
//! loopback hub for development and tests, and an MQTT-backed client
//! speaking IoT-hub-style twin topics.

pub mod loopback;
pub mod mqtt;

pub use loopback::LoopbackHub;
pub use mqtt::MqttTwinConnector;

use crate::config::DeviceConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Routing tag for sensor telemetry messages.
pub const TELEMETRY_COMPONENT: &str = "sensors";
/// Component name wrapping twin properties.
pub const PROPERTY_COMPONENT: &str = "settings";

/// Connection credentials, either DPS-style (device id + scope + key) or a
/// raw connection string. Opaque to the engine beyond validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "deviceId", default)]
    pub device_id: String,
    #[serde(rename = "scopeId", default)]
    pub scope_id: Option<String>,
    #[serde(rename = "deviceKey", default)]
    pub device_key: Option<String>,
    #[serde(rename = "connectionString", default)]
    pub connection_string: Option<String>,
}

impl Credentials {
    /// Decode the base64 JSON envelope carried by device QR codes.
    pub fn from_qr_envelope(encoded: &str) -> Result<Self> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AgentError::InvalidCredentials(e.to_string()))?;
        let credentials: Credentials = serde_json::from_slice(&raw)
            .map_err(|e| AgentError::InvalidCredentials(e.to_string()))?;
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn from_device_config(config: &DeviceConfig) -> Result<Self> {
        let credentials = Self {
            device_id: config.device_id.clone(),
            scope_id: config.scope_id.clone(),
            device_key: config.device_key.clone(),
            connection_string: config.connection_string.clone(),
        };
        credentials.validate()?;
        Ok(credentials)
    }

    fn validate(&self) -> Result<()> {
        if self.connection_string.is_some() {
            return Ok(());
        }
        if self.device_id.is_empty() {
            return Err(AgentError::InvalidCredentials("missing device id".into()));
        }
        Ok(())
    }
}

/// Full device twin as last fetched from the cloud.
#[derive(Debug, Clone, Default)]
pub struct Twin {
    /// Cloud-requested property values (authoritative).
    pub desired: Map<String, Value>,
    /// Device-confirmed property values.
    pub reported: Map<String, Value>,
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct CommandReply {
    pub status: CommandStatus,
    pub payload: Value,
}

/// Inbound remote command with a single-use synchronous reply primitive.
pub struct CommandRequest {
    pub name: String,
    pub payload: String,
    reply_tx: Mutex<Option<oneshot::Sender<CommandReply>>>,
}

impl CommandRequest {
    /// Build a request plus the receiver the transport uses to deliver the
    /// reply back to the cloud.
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> (Self, oneshot::Receiver<CommandReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                name: name.into(),
                payload: payload.into(),
                reply_tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Send the command reply. At most one reply per command; replies after
    /// the first, or after the transport dropped the window, fail with
    /// [`AgentError::ReplyChannelClosed`].
    pub fn reply(&self, status: CommandStatus, payload: Value) -> Result<()> {
        let tx = self
            .reply_tx
            .lock()
            .take()
            .ok_or(AgentError::ReplyChannelClosed)?;
        tx.send(CommandReply { status, payload })
            .map_err(|_| AgentError::ReplyChannelClosed)
    }

    pub fn has_replied(&self) -> bool {
        self.reply_tx.lock().is_none()
    }
}

/// Acknowledgement for an applied property update: the unwrapped name/value
/// pair plus the desired version being confirmed.
#[derive(Debug, Clone)]
pub struct PropertyAck {
    pub name: String,
    pub value: Value,
    pub version: i64,
}

/// Inbound property delta with a single-use acknowledgement primitive.
pub struct PropertyUpdate {
    pub name: String,
    /// Raw delta value; may be a component wrapper around the actual pair.
    pub value: Value,
    pub version: i64,
    ack_tx: Mutex<Option<oneshot::Sender<PropertyAck>>>,
}

impl PropertyUpdate {
    pub fn new(
        name: impl Into<String>,
        value: Value,
        version: i64,
    ) -> (Self, oneshot::Receiver<PropertyAck>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                name: name.into(),
                value,
                version,
                ack_tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Acknowledge the applied update back to the cloud. Must be called
    /// after the store applied it and before the next update for the same
    /// property is processed.
    pub fn ack(&self, applied_name: &str, applied_value: &Value) -> Result<()> {
        let tx = self
            .ack_tx
            .lock()
            .take()
            .ok_or(AgentError::ReplyChannelClosed)?;
        tx.send(PropertyAck {
            name: applied_name.to_string(),
            value: applied_value.clone(),
            version: self.version,
        })
        .map_err(|_| AgentError::ReplyChannelClosed)
    }
}

/// Events pushed from the cloud to a connected device.
pub enum CloudEvent {
    Command(CommandRequest),
    Property(PropertyUpdate),
}

/// Live cloud connection. All operations are opaque async round-trips with
/// success/failure outcomes only.
#[async_trait]
pub trait CloudTwinClient: Send + Sync {
    fn device_id(&self) -> &str;

    /// Push one telemetry message: field name(s) to value(s), tagged with a
    /// routing identifier for component-scoped delivery.
    async fn send_telemetry(&self, fields: Map<String, Value>, routing_tag: &str) -> Result<()>;

    /// Patch reported properties.
    async fn send_property(&self, patch: Value) -> Result<()>;

    /// Fetch the full twin document.
    async fn fetch_twin(&self) -> Result<Twin>;

    /// Next inbound command/property event; `None` once the connection is
    /// gone.
    async fn next_event(&self) -> Option<CloudEvent>;

    /// Tear down the underlying connection.
    async fn shutdown(&self);
}

/// Factory for live connections; the session owns exactly one at a time.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn CloudTwinClient>>;
}
