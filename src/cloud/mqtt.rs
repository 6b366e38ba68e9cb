//! MQTT-backed cloud twin client.
//!
//! Speaks IoT-hub-style twin topics over a plain MQTT broker: telemetry on
//! the device events topic, reported-property patches and twin fetches on
//! the `$iothub/twin` hierarchy, direct methods on `$iothub/methods`. The
//! engine never sees any of this; it only holds the [`CloudTwinClient`]
//! capability.

use super::{
    CloudConnector, CloudEvent, CloudTwinClient, CommandRequest, CommandStatus, Credentials,
    PropertyUpdate, Twin,
};
use crate::config::MqttConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const TWIN_RES_PREFIX: &str = "$iothub/twin/res/";
const METHOD_POST_PREFIX: &str = "$iothub/methods/POST/";
const DESIRED_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired";
const REPORTED_PATCH_TOPIC: &str = "$iothub/twin/PATCH/properties/reported";
const TWIN_GET_TOPIC: &str = "$iothub/twin/GET";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TWIN_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
// After this many consecutive poll failures the event stream is closed and
// the session takes over reconnection.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

type PendingTwinMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Twin>>>>;

/// Connector building MQTT-backed twin clients from broker configuration.
pub struct MqttTwinConnector {
    config: MqttConfig,
}

impl MqttTwinConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CloudConnector for MqttTwinConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn CloudTwinClient>> {
        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));

        // Broker credentials take precedence; otherwise authenticate as the
        // device itself.
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        } else if let Some(key) = &credentials.device_key {
            options.set_credentials(&credentials.device_id, key);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (connected_tx, connected_rx) = oneshot::channel();
        let pending_twin: PendingTwinMap = Arc::new(Mutex::new(HashMap::new()));

        let loop_task = spawn_event_loop(
            event_loop,
            client.clone(),
            event_tx,
            pending_twin.clone(),
            connected_tx,
        );

        match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(())) => {
                info!(
                    "[MQTT] Connected to {}:{}",
                    self.config.broker_host, self.config.broker_port
                );
            }
            Ok(Err(_)) | Err(_) => {
                loop_task.abort();
                return Err(AgentError::ConnectionFailed(format!(
                    "no broker acknowledgement from {}:{}",
                    self.config.broker_host, self.config.broker_port
                )));
            }
        }

        for topic in [
            "$iothub/twin/res/#",
            "$iothub/methods/POST/#",
            "$iothub/twin/PATCH/properties/desired/#",
        ] {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| AgentError::ConnectionFailed(format!("subscribe {topic}: {e:?}")))?;
        }

        Ok(Arc::new(MqttTwinClient {
            device_id: credentials.device_id.clone(),
            client,
            events: tokio::sync::Mutex::new(event_rx),
            pending_twin,
            next_rid: AtomicU64::new(1),
            loop_task,
        }))
    }
}

struct MqttTwinClient {
    device_id: String,
    client: AsyncClient,
    events: tokio::sync::Mutex<mpsc::Receiver<CloudEvent>>,
    pending_twin: PendingTwinMap,
    next_rid: AtomicU64,
    loop_task: JoinHandle<()>,
}

#[async_trait]
impl CloudTwinClient for MqttTwinClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn send_telemetry(&self, fields: Map<String, Value>, routing_tag: &str) -> Result<()> {
        let topic = format!(
            "devices/{}/messages/events/%24.sub={}",
            self.device_id, routing_tag
        );
        let body = serde_json::to_vec(&Value::Object(fields))?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| AgentError::SendFailed(format!("telemetry: {e:?}")))
    }

    async fn send_property(&self, patch: Value) -> Result<()> {
        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        let topic = format!("{REPORTED_PATCH_TOPIC}/?$rid={rid}");
        let body = serde_json::to_vec(&patch)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| AgentError::SendFailed(format!("property patch: {e:?}")))
    }

    async fn fetch_twin(&self) -> Result<Twin> {
        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_twin.lock().insert(rid, tx);

        let topic = format!("{TWIN_GET_TOPIC}/?$rid={rid}");
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, Vec::<u8>::new())
            .await
        {
            self.pending_twin.lock().remove(&rid);
            return Err(AgentError::TwinFetchFailed(format!("{e:?}")));
        }

        match tokio::time::timeout(TWIN_FETCH_TIMEOUT, rx).await {
            Ok(Ok(twin)) => Ok(twin),
            Ok(Err(_)) => Err(AgentError::TwinFetchFailed("response channel closed".into())),
            Err(_) => {
                self.pending_twin.lock().remove(&rid);
                Err(AgentError::TwinFetchFailed("timed out".into()))
            }
        }
    }

    async fn next_event(&self) -> Option<CloudEvent> {
        self.events.lock().await.recv().await
    }

    async fn shutdown(&self) {
        self.loop_task.abort();
        let _ = self.client.disconnect().await;
        debug!("[MQTT] Client for {} shut down", self.device_id);
    }
}

/// Run the MQTT event loop, routing inbound publishes to twin responses,
/// command requests, and desired-property deltas.
fn spawn_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    event_tx: mpsc::Sender<CloudEvent>,
    pending_twin: PendingTwinMap,
    connected_tx: oneshot::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connected_tx = Some(connected_tx);
        let mut consecutive_errors = 0u32;

        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    consecutive_errors = 0;
                    match event {
                        Event::Incoming(Packet::ConnAck(_)) => {
                            if let Some(tx) = connected_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                        Event::Incoming(Packet::Publish(publish)) => {
                            let payload = match String::from_utf8(publish.payload.to_vec()) {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!("[MQTT] Invalid UTF-8 in payload: {}", e);
                                    continue;
                                }
                            };
                            handle_publish(
                                &publish.topic,
                                &payload,
                                &client,
                                &event_tx,
                                &pending_twin,
                            );
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("[MQTT] Connection lost: {:?}", e);
                        // Dropping event_tx ends the session's event pump,
                        // which drives session-level reconnection.
                        break;
                    }
                    warn!("[MQTT] Poll error ({}): {:?}", consecutive_errors, e);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    })
}

fn handle_publish(
    topic: &str,
    payload: &str,
    client: &AsyncClient,
    event_tx: &mpsc::Sender<CloudEvent>,
    pending_twin: &PendingTwinMap,
) {
    if let Some(rest) = topic.strip_prefix(TWIN_RES_PREFIX) {
        handle_twin_response(rest, payload, pending_twin);
    } else if let Some(rest) = topic.strip_prefix(METHOD_POST_PREFIX) {
        handle_method(rest, payload, client, event_tx);
    } else if topic.starts_with(DESIRED_PATCH_PREFIX) {
        handle_desired_patch(payload, client, event_tx);
    } else {
        debug!("[MQTT] Ignoring publish on {}", topic);
    }
}

fn handle_twin_response(topic_rest: &str, payload: &str, pending_twin: &PendingTwinMap) {
    let status: u16 = topic_rest
        .split('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let Some(rid) = parse_rid(topic_rest) else {
        warn!("[MQTT] Twin response without $rid");
        return;
    };
    let Some(tx) = pending_twin.lock().remove(&rid) else {
        return;
    };
    if status != 200 {
        warn!("[MQTT] Twin fetch {} failed with status {}", rid, status);
        // Dropping tx surfaces the failure to the waiting fetch.
        return;
    }

    #[derive(serde::Deserialize, Default)]
    struct TwinBody {
        #[serde(default)]
        desired: Map<String, Value>,
        #[serde(default)]
        reported: Map<String, Value>,
    }

    match serde_json::from_str::<TwinBody>(payload) {
        Ok(body) => {
            let _ = tx.send(Twin {
                desired: body.desired,
                reported: body.reported,
                fetched_at: Some(Utc::now()),
            });
        }
        Err(e) => warn!("[MQTT] Malformed twin document: {}", e),
    }
}

fn handle_method(
    topic_rest: &str,
    payload: &str,
    client: &AsyncClient,
    event_tx: &mpsc::Sender<CloudEvent>,
) {
    let Some(name) = topic_rest.split('/').next().filter(|s| !s.is_empty()) else {
        warn!("[MQTT] Method call without a name");
        return;
    };
    let Some(rid) = parse_rid(topic_rest) else {
        warn!("[MQTT] Method call without $rid");
        return;
    };

    let (request, reply_rx) = CommandRequest::new(name, payload);
    let reply_client = client.clone();
    // Service the reply window: publish the method response once (and only
    // if) the router replies.
    tokio::spawn(async move {
        if let Ok(reply) = reply_rx.await {
            let code = match reply.status {
                CommandStatus::Success => 200,
                CommandStatus::Failure => 500,
            };
            let topic = format!("$iothub/methods/res/{code}/?$rid={rid}");
            let body = reply.payload.to_string();
            if let Err(e) = reply_client.publish(topic, QoS::AtLeastOnce, false, body).await {
                warn!("[MQTT] Method reply publish failed: {:?}", e);
            }
        }
    });

    if event_tx.try_send(CloudEvent::Command(request)).is_err() {
        warn!("[MQTT] Event channel full, command dropped");
    }
}

fn handle_desired_patch(payload: &str, client: &AsyncClient, event_tx: &mpsc::Sender<CloudEvent>) {
    let delta: Map<String, Value> = match serde_json::from_str(payload) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!("[MQTT] Desired patch is not an object");
            return;
        }
        Err(e) => {
            warn!("[MQTT] Malformed desired patch: {}", e);
            return;
        }
    };
    let version = delta
        .get("$version")
        .and_then(Value::as_i64)
        .unwrap_or_default();

    for (name, value) in delta {
        if name.starts_with('$') {
            continue;
        }
        let (update, ack_rx) = PropertyUpdate::new(&name, value, version);
        let ack_client = client.clone();
        // Acknowledge by echoing the applied value into reported state with
        // the confirmed desired version.
        tokio::spawn(async move {
            if let Ok(ack) = ack_rx.await {
                let body = serde_json::json!({
                    (ack.name): { "value": ack.value, "ac": 200, "av": ack.version }
                })
                .to_string();
                let topic = format!("{REPORTED_PATCH_TOPIC}/?$rid=0");
                if let Err(e) = ack_client.publish(topic, QoS::AtLeastOnce, false, body).await {
                    warn!("[MQTT] Property ack publish failed: {:?}", e);
                }
            }
        });

        if event_tx.try_send(CloudEvent::Property(update)).is_err() {
            warn!("[MQTT] Event channel full, property delta dropped");
        }
    }
}

fn parse_rid(topic: &str) -> Option<u64> {
    let idx = topic.find("$rid=")?;
    let rest = &topic[idx + 5..];
    let end = rest.find('&').unwrap_or(rest.len());
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rid() {
        assert_eq!(parse_rid("200/?$rid=42"), Some(42));
        assert_eq!(parse_rid("200/?$rid=42&foo=1"), Some(42));
        assert_eq!(parse_rid("200/"), None);
        assert_eq!(parse_rid("200/?$rid=abc"), None);
    }
}
