//! In-process loopback cloud hub.
//!
//! Stands in for the real twin service during development and in tests: it
//! records outbound telemetry and property patches, serves a configurable
//! twin document, and lets the embedding code push commands and property
//! deltas at the device as the cloud would.

use super::{
    CloudConnector, CloudEvent, CloudTwinClient, CommandReply, CommandRequest, Credentials,
    PropertyAck, PropertyUpdate, Twin,
};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct HubInner {
    connect_delay: Mutex<Duration>,
    fail_connect: AtomicBool,
    fail_property_sends: AtomicBool,
    desired: Mutex<Map<String, Value>>,
    reported: Mutex<Map<String, Value>>,
    telemetry: Mutex<Vec<(Map<String, Value>, String)>>,
    event_tx: Mutex<Option<mpsc::Sender<CloudEvent>>>,
    next_version: AtomicI64,
}

/// The hub half: connector plus cloud-side controls for tests and demos.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                connect_delay: Mutex::new(Duration::ZERO),
                fail_connect: AtomicBool::new(false),
                fail_property_sends: AtomicBool::new(false),
                desired: Mutex::new(Map::new()),
                reported: Mutex::new(Map::new()),
                telemetry: Mutex::new(Vec::new()),
                event_tx: Mutex::new(None),
                next_version: AtomicI64::new(1),
            }),
        }
    }

    /// Delay applied to every connect attempt (for cancellation tests).
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_property_sends(&self, fail: bool) {
        self.inner.fail_property_sends.store(fail, Ordering::SeqCst);
    }

    /// Seed a desired twin property served by the next `fetch_twin`.
    pub fn set_desired(&self, name: &str, value: Value) {
        self.inner.desired.lock().insert(name.to_string(), value);
    }

    /// Push a command at the connected device. Returns the reply window, or
    /// `None` if no device is connected.
    pub fn push_command(
        &self,
        name: &str,
        payload: &str,
    ) -> Option<oneshot::Receiver<CommandReply>> {
        let tx = self.inner.event_tx.lock().clone()?;
        let (request, reply_rx) = CommandRequest::new(name, payload);
        tx.try_send(CloudEvent::Command(request)).ok()?;
        Some(reply_rx)
    }

    /// Push a property delta at the connected device. Returns the
    /// acknowledgement window, or `None` if no device is connected.
    pub fn push_property(
        &self,
        name: &str,
        value: Value,
    ) -> Option<oneshot::Receiver<PropertyAck>> {
        let tx = self.inner.event_tx.lock().clone()?;
        let version = self.inner.next_version.fetch_add(1, Ordering::SeqCst);
        let (update, ack_rx) = PropertyUpdate::new(name, value, version);
        tx.try_send(CloudEvent::Property(update)).ok()?;
        Some(ack_rx)
    }

    /// Telemetry messages received so far, in arrival order.
    pub fn telemetry_received(&self) -> Vec<(Map<String, Value>, String)> {
        self.inner.telemetry.lock().clone()
    }

    /// Reported property state accumulated from device patches.
    pub fn reported(&self) -> Map<String, Value> {
        self.inner.reported.lock().clone()
    }

    pub fn is_device_connected(&self) -> bool {
        self.inner.event_tx.lock().is_some()
    }

    /// Drop the hub side of the event channel, as a broken link would. The
    /// connected client observes end-of-events on its next poll.
    pub fn drop_connection(&self) {
        *self.inner.event_tx.lock() = None;
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudConnector for LoopbackHub {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn CloudTwinClient>> {
        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(AgentError::ConnectionFailed(
                "loopback hub rejected the connection".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(64);
        *self.inner.event_tx.lock() = Some(tx);
        debug!("[Loopback] Device {} connected", credentials.device_id);

        Ok(Arc::new(LoopbackClient {
            device_id: credentials.device_id.clone(),
            inner: self.inner.clone(),
            events: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct LoopbackClient {
    device_id: String,
    inner: Arc<HubInner>,
    events: tokio::sync::Mutex<mpsc::Receiver<CloudEvent>>,
}

#[async_trait]
impl CloudTwinClient for LoopbackClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn send_telemetry(&self, fields: Map<String, Value>, routing_tag: &str) -> Result<()> {
        self.inner
            .telemetry
            .lock()
            .push((fields, routing_tag.to_string()));
        Ok(())
    }

    async fn send_property(&self, patch: Value) -> Result<()> {
        if self.inner.fail_property_sends.load(Ordering::SeqCst) {
            return Err(AgentError::SendFailed(
                "loopback hub dropped the property patch".into(),
            ));
        }
        if let Value::Object(map) = patch {
            let mut reported = self.inner.reported.lock();
            for (key, value) in map {
                reported.insert(key, value);
            }
            Ok(())
        } else {
            Err(AgentError::SendFailed("property patch must be an object".into()))
        }
    }

    async fn fetch_twin(&self) -> Result<Twin> {
        Ok(Twin {
            desired: self.inner.desired.lock().clone(),
            reported: self.inner.reported.lock().clone(),
            fetched_at: Some(Utc::now()),
        })
    }

    async fn next_event(&self) -> Option<CloudEvent> {
        self.events.lock().await.recv().await
    }

    async fn shutdown(&self) {
        *self.inner.event_tx.lock() = None;
        debug!("[Loopback] Device {} disconnected", self.device_id);
    }
}
