//! Inbound remote command routing.
//!
//! Commands arrive by name with a JSON payload and are dispatched through a
//! closed tagged-variant table; unknown names are rejected explicitly
//! instead of falling through. Sensor-control commands mutate the target
//! sensor and echo the applied parameters; the actuator command replies
//! before the (multi-second) actuation runs and only logs its completion.

use crate::actuator::Actuator;
use crate::cloud::{CommandRequest, CommandStatus};
use crate::config::DEFAULT_DELIVERY_INTERVAL_MS;
use crate::error::{AgentError, Result};
use crate::eventlog::EventLog;
use crate::sensors::SensorRegistry;
use log::warn;
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use strum::EnumString;

/// Closed set of command identifiers the device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum CommandName {
    /// Pulse the local actuator; replies accepted-then-runs.
    #[strum(serialize = "lightToggle")]
    LightToggle,
    /// Enable or disable one sensor.
    #[strum(serialize = "enableSensors")]
    EnableDisable,
    /// Change one sensor's sampling interval (seconds).
    #[strum(serialize = "setFrequency")]
    SetFrequency,
}

/// Command payload; the populated field set depends on the command name.
#[derive(Debug, Default, Deserialize)]
pub struct CommandPayload {
    pub sensor: Option<String>,
    pub enable: Option<bool>,
    /// Sampling interval in seconds.
    pub interval: Option<u64>,
    pub pulses: Option<u32>,
    /// Pulse on-time in seconds.
    pub duration: Option<u64>,
    /// Gap between pulses in seconds.
    pub delay: Option<u64>,
}

pub struct CommandRouter {
    registry: Arc<SensorRegistry>,
    actuator: Arc<dyn Actuator>,
    events: Arc<EventLog>,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<SensorRegistry>,
        actuator: Arc<dyn Actuator>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            registry,
            actuator,
            events,
        }
    }

    /// Handle one inbound command. Malformed payloads surface as an error
    /// without any reply; every other rejection carries an explicit error
    /// reply so the caller is never left guessing.
    pub async fn handle(&self, request: CommandRequest) -> Result<()> {
        let Ok(name) = CommandName::from_str(&request.name) else {
            self.events
                .error(format!("Unknown command: {}", request.name));
            self.reply(
                &request,
                CommandStatus::Failure,
                json!({"error": format!("unknown command: {}", request.name)}),
            );
            return Err(AgentError::UnknownCommand(request.name.clone()));
        };

        let raw = if request.payload.trim().is_empty() {
            "{}"
        } else {
            request.payload.as_str()
        };
        let payload: CommandPayload = match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(e) => {
                // Parsing failure is surfaced but gets no reply; the reply
                // window simply lapses.
                self.events
                    .error(format!("Malformed payload for {}: {}", request.name, e));
                return Err(AgentError::MalformedCommand(e.to_string()));
            }
        };

        match name {
            CommandName::LightToggle => self.handle_light_toggle(&request, payload),
            CommandName::EnableDisable | CommandName::SetFrequency => {
                self.handle_sensor_control(name, &request, payload)
            }
        }
    }

    fn handle_light_toggle(&self, request: &CommandRequest, payload: CommandPayload) -> Result<()> {
        // Accepted/started goes out before the actuation; completion is
        // observational only, never acknowledged a second time.
        self.reply(
            request,
            CommandStatus::Success,
            json!({"execution": "started"}),
        );

        let pulses = payload.pulses.unwrap_or(1);
        let duration = Duration::from_secs(payload.duration.unwrap_or(1));
        let delay = Duration::from_secs(payload.delay.unwrap_or(1));
        self.events.info(format!(
            "Actuator will pulse {} time(s), {}s each, {}s apart",
            pulses,
            duration.as_secs(),
            delay.as_secs()
        ));

        let actuator = self.actuator.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match actuator.pulse(pulses, duration, delay).await {
                Ok(()) => events.info("Actuator pulse sequence finished"),
                Err(e) => events.error(format!("Actuator failed: {}", e)),
            }
        });
        Ok(())
    }

    fn handle_sensor_control(
        &self,
        name: CommandName,
        request: &CommandRequest,
        payload: CommandPayload,
    ) -> Result<()> {
        let Some(sensor_id) = payload.sensor else {
            self.reply(
                request,
                CommandStatus::Failure,
                json!({"error": "missing sensor id"}),
            );
            return Err(AgentError::MissingCommandField("sensor"));
        };

        let Some(sensor) = self.registry.sensor(&sensor_id) else {
            self.events
                .error(format!("Command targets unknown sensor: {}", sensor_id));
            self.reply(
                request,
                CommandStatus::Failure,
                json!({"error": format!("unknown sensor: {}", sensor_id)}),
            );
            return Err(AgentError::SensorNotFound(sensor_id));
        };

        match name {
            CommandName::EnableDisable => {
                let enable = payload.enable.unwrap_or(false);
                if let Err(e) = sensor.enable(enable) {
                    self.reply(
                        request,
                        CommandStatus::Failure,
                        json!({"error": e.to_string()}),
                    );
                    return Err(e);
                }
                self.events
                    .info(format!("Sensor {} enabled={}", sensor_id, enable));
                self.reply(request, CommandStatus::Success, json!({"enabled": enable}));
            }
            CommandName::SetFrequency => {
                let seconds = payload
                    .interval
                    .unwrap_or(DEFAULT_DELIVERY_INTERVAL_MS / 1000);
                if let Err(e) = sensor.send_interval(Duration::from_secs(seconds)) {
                    self.reply(
                        request,
                        CommandStatus::Failure,
                        json!({"error": e.to_string()}),
                    );
                    return Err(e);
                }
                self.events
                    .info(format!("Sensor {} interval={}s", sensor_id, seconds));
                self.reply(request, CommandStatus::Success, json!({"interval": seconds}));
            }
            CommandName::LightToggle => unreachable!("routed separately"),
        }
        Ok(())
    }

    /// Reply failures are fire-and-forget: the window may already have
    /// lapsed on the cloud side.
    fn reply(&self, request: &CommandRequest, status: CommandStatus, payload: Value) {
        if let Err(e) = request.reply(status, payload) {
            warn!("[Command] Reply for {} not delivered: {}", request.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PulseActuator;
    use crate::cloud::CommandReply;
    use crate::sensors::driver::MotionDriver;
    use crate::sensors::ids;
    use tokio::sync::oneshot;

    fn test_router() -> (CommandRouter, Arc<SensorRegistry>, Arc<PulseActuator>) {
        let mut registry = SensorRegistry::new(Duration::from_millis(20), true);
        registry.register("Accelerometer", Arc::new(MotionDriver::accelerometer()));
        let registry = Arc::new(registry);
        let actuator = Arc::new(PulseActuator::new());
        let router = CommandRouter::new(
            registry.clone(),
            actuator.clone(),
            Arc::new(EventLog::new()),
        );
        (router, registry, actuator)
    }

    async fn reply_of(rx: oneshot::Receiver<CommandReply>) -> CommandReply {
        tokio::time::timeout(Duration::from_millis(200), rx)
            .await
            .expect("reply within deadline")
            .expect("reply sent")
    }

    #[tokio::test]
    async fn test_enable_disable_command() {
        let (router, registry, _) = test_router();
        let sensor = registry.sensor(ids::ACCELEROMETER).unwrap();
        sensor.enable(true).unwrap();

        let (request, reply_rx) = CommandRequest::new(
            "enableSensors",
            r#"{"sensor":"accelerometer","enable":false}"#,
        );
        router.handle(request).await.unwrap();

        let reply = reply_of(reply_rx).await;
        assert_eq!(reply.status, CommandStatus::Success);
        assert_eq!(reply.payload, json!({"enabled": false}));
        assert!(!sensor.is_enabled());
        assert!(!sensor.has_active_subscription());
    }

    #[tokio::test]
    async fn test_set_frequency_command() {
        let (router, registry, _) = test_router();
        let sensor = registry.sensor(ids::ACCELEROMETER).unwrap();

        let (request, reply_rx) =
            CommandRequest::new("setFrequency", r#"{"sensor":"accelerometer","interval":2}"#);
        router.handle(request).await.unwrap();

        let reply = reply_of(reply_rx).await;
        assert_eq!(reply.payload, json!({"interval": 2}));
        assert_eq!(sensor.interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unknown_sensor_changes_nothing_and_replies_error() {
        let (router, registry, _) = test_router();
        let sensor = registry.sensor(ids::ACCELEROMETER).unwrap();

        let (request, reply_rx) =
            CommandRequest::new("enableSensors", r#"{"sensor":"thermometer","enable":true}"#);
        let result = router.handle(request).await;
        assert!(matches!(result, Err(AgentError::SensorNotFound(_))));

        let reply = reply_of(reply_rx).await;
        assert_eq!(reply.status, CommandStatus::Failure);
        assert!(!sensor.is_enabled());
    }

    #[tokio::test]
    async fn test_malformed_payload_gets_no_reply() {
        let (router, _, _) = test_router();

        let (request, mut reply_rx) = CommandRequest::new("enableSensors", "{not json");
        let result = router.handle(request).await;
        assert!(matches!(result, Err(AgentError::MalformedCommand(_))));

        // The reply window lapses without a reply.
        assert!(reply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected_explicitly() {
        let (router, _, _) = test_router();

        let (request, reply_rx) = CommandRequest::new("selfDestruct", "{}");
        let result = router.handle(request).await;
        assert!(matches!(result, Err(AgentError::UnknownCommand(_))));

        let reply = reply_of(reply_rx).await;
        assert_eq!(reply.status, CommandStatus::Failure);
    }

    #[tokio::test]
    async fn test_light_toggle_replies_before_actuation_completes() {
        let (router, _, actuator) = test_router();

        let (request, reply_rx) =
            CommandRequest::new("lightToggle", r#"{"pulses":2,"duration":1,"delay":1}"#);
        router.handle(request).await.unwrap();

        // Started reply arrives while the pulse sequence is still running.
        let reply = reply_of(reply_rx).await;
        assert_eq!(reply.payload, json!({"execution": "started"}));
        assert_eq!(actuator.completed_pulses(), 0);
    }
}
