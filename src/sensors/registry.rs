//! Sensor registry and listener dispatch.
//!
//! The registry is the single owner of all [`Sensor`] instances. Telemetry
//! consumers attach handlers keyed by (sensor id, event kind); dispatch is
//! synchronous and runs handlers in registration order. Tokens returned by
//! `add_listener` make removal deterministic — no dangling dispatch after a
//! sensor is disabled or a consumer detaches.

use super::driver::SensorDriver;
use super::sensor::Sensor;
use super::SensorReading;
use log::warn;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Event kinds a sensor can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new telemetry sample is available.
    DataAvailable,
}

/// Handler invoked synchronously with each emitted sample.
pub type SensorEventHandler = Arc<dyn Fn(&str, &SensorReading) + Send + Sync>;

/// Opaque handle identifying one listener registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerToken {
    id: Uuid,
    sensor_id: String,
    kind: EventKind,
}

/// Listener table shared between the registry and its sensors.
///
/// Sensors dispatch through this hub from their subscription tasks; the
/// registry mutates it on add/remove.
pub struct ListenerHub {
    listeners: Mutex<HashMap<(String, EventKind), Vec<(Uuid, SensorEventHandler)>>>,
}

impl ListenerHub {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, sensor_id: &str, kind: EventKind, handler: SensorEventHandler) -> ListenerToken {
        let token = ListenerToken {
            id: Uuid::new_v4(),
            sensor_id: sensor_id.to_string(),
            kind,
        };
        self.listeners
            .lock()
            .entry((token.sensor_id.clone(), kind))
            .or_default()
            .push((token.id, handler));
        token
    }

    fn remove(&self, token: &ListenerToken) {
        let mut listeners = self.listeners.lock();
        if let Some(entries) = listeners.get_mut(&(token.sensor_id.clone(), token.kind)) {
            entries.retain(|(id, _)| *id != token.id);
            if entries.is_empty() {
                listeners.remove(&(token.sensor_id.clone(), token.kind));
            }
        }
    }

    /// Invoke every handler attached to (sensor id, kind), in registration
    /// order. Handlers run outside the table lock so they may re-enter the
    /// registry.
    pub fn dispatch(&self, sensor_id: &str, kind: EventKind, reading: &SensorReading) {
        let handlers: Vec<SensorEventHandler> = {
            let listeners = self.listeners.lock();
            match listeners.get(&(sensor_id.to_string(), kind)) {
                Some(entries) => entries.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(sensor_id, reading);
        }
    }

    /// Number of live registrations, across all sensors. Used at teardown to
    /// verify no listener leakage.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }
}

/// Owner of the sensor fleet.
pub struct SensorRegistry {
    sensors: BTreeMap<String, Arc<Sensor>>,
    hub: Arc<ListenerHub>,
    default_interval: Duration,
    simulated: bool,
}

impl SensorRegistry {
    /// Create an empty registry. Sensors start disabled, with the given
    /// default interval and simulation mode.
    pub fn new(default_interval: Duration, simulated: bool) -> Self {
        Self {
            sensors: BTreeMap::new(),
            hub: Arc::new(ListenerHub::new()),
            default_interval,
            simulated,
        }
    }

    /// Registry populated with the standard device fleet.
    pub fn with_standard_fleet(default_interval: Duration, simulated: bool) -> Self {
        use super::driver::{GeoDriver, MotionDriver, ScalarDriver};
        let mut registry = Self::new(default_interval, simulated);
        registry.register("Accelerometer", Arc::new(MotionDriver::accelerometer()));
        registry.register("Gyroscope", Arc::new(MotionDriver::gyroscope()));
        registry.register("Magnetometer", Arc::new(MotionDriver::magnetometer()));
        registry.register("Barometer", Arc::new(ScalarDriver::barometer()));
        registry.register("Battery", Arc::new(ScalarDriver::battery()));
        registry.register("Geolocation", Arc::new(GeoDriver::default()));
        registry
    }

    /// Construct and own a sensor for the given driver. The sensor id is the
    /// driver's telemetry field name. Construction-time only; the registry
    /// set is fixed once the agent starts.
    pub fn register(&mut self, display_name: impl Into<String>, driver: Arc<dyn SensorDriver>) -> Arc<Sensor> {
        let sensor = Arc::new(Sensor::new(
            display_name,
            driver,
            self.hub.clone(),
            self.default_interval,
            self.simulated,
        ));
        self.sensors.insert(sensor.id().to_string(), sensor.clone());
        sensor
    }

    pub fn sensor(&self, id: &str) -> Option<Arc<Sensor>> {
        self.sensors.get(id).cloned()
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Arc<Sensor>> {
        self.sensors.values()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Attach a handler to one sensor's events.
    pub fn add_listener(
        &self,
        sensor_id: &str,
        kind: EventKind,
        handler: SensorEventHandler,
    ) -> ListenerToken {
        self.hub.add(sensor_id, kind, handler)
    }

    /// Detach a previously registered handler. Safe to call after the sensor
    /// was disabled, or twice with the same token.
    pub fn remove_listener(&self, token: &ListenerToken) {
        self.hub.remove(token);
    }

    /// Live listener registrations across the fleet.
    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }

    /// Forward a new process-wide interval to every sensor, enabled or not.
    /// Disabled sensors pick the value up on next enable.
    pub fn apply_interval(&self, interval: Duration) {
        for sensor in self.sensors.values() {
            if let Err(e) = sensor.send_interval(interval) {
                warn!("[Registry] {}: interval change failed: {}", sensor.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::driver::MotionDriver;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_registry() -> SensorRegistry {
        let mut registry = SensorRegistry::new(Duration::from_millis(20), true);
        registry.register("Accelerometer", Arc::new(MotionDriver::accelerometer()));
        registry.register("Gyroscope", Arc::new(MotionDriver::gyroscope()));
        registry
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let registry = test_registry();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        registry.add_listener(
            super::super::ids::ACCELEROMETER,
            EventKind::DataAvailable,
            Arc::new(move |_, _| first.lock().push(1)),
        );
        let second = order.clone();
        registry.add_listener(
            super::super::ids::ACCELEROMETER,
            EventKind::DataAvailable,
            Arc::new(move |_, _| second.lock().push(2)),
        );

        registry.hub.dispatch(
            super::super::ids::ACCELEROMETER,
            EventKind::DataAvailable,
            &SensorReading::Scalar(1.0),
        );
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_remove_listener_is_safe_after_disable() {
        let registry = test_registry();
        let sensor = registry.sensor(super::super::ids::ACCELEROMETER).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let token = registry.add_listener(
            super::super::ids::ACCELEROMETER,
            EventKind::DataAvailable,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sensor.enable(true).unwrap();
        sensor.enable(false).unwrap();

        registry.remove_listener(&token);
        // Removing again must be a no-op.
        registry.remove_listener(&token);
        assert_eq!(registry.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_interval_forwarded_to_disabled_sensors() {
        let registry = test_registry();
        let sensor = registry.sensor(super::super::ids::GYROSCOPE).unwrap();
        assert!(!sensor.is_enabled());

        registry.apply_interval(Duration::from_millis(70));
        assert_eq!(sensor.interval(), Duration::from_millis(70));
    }
}
