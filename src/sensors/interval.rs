//! Process-wide delivery interval coordination.
//!
//! One desired sampling interval for the whole fleet. Changes fan out to
//! every registered sensor through the registry; repeated identical values
//! are absorbed here so they cannot cause resubscribe storms.

use super::registry::SensorRegistry;
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub struct DeliveryIntervalCoordinator {
    registry: Arc<SensorRegistry>,
    current: Mutex<Duration>,
}

impl DeliveryIntervalCoordinator {
    pub fn new(registry: Arc<SensorRegistry>, default_interval: Duration) -> Self {
        Self {
            registry,
            current: Mutex::new(default_interval),
        }
    }

    pub fn current(&self) -> Duration {
        *self.current.lock()
    }

    /// Set the process-wide interval. Returns `true` if the value changed
    /// and was pushed to the fleet; repeated identical values are no-ops.
    pub fn set_interval(&self, interval: Duration) -> bool {
        {
            let mut current = self.current.lock();
            if *current == interval {
                return false;
            }
            *current = interval;
        }
        info!("[Interval] Delivery interval set to {:?}", interval);
        self.registry.apply_interval(interval);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::driver::MotionDriver;
    use super::super::ids;
    use super::*;

    #[tokio::test]
    async fn test_identical_value_is_absorbed() {
        let mut registry = SensorRegistry::new(Duration::from_millis(5000), true);
        registry.register("Accelerometer", Arc::new(MotionDriver::accelerometer()));
        let registry = Arc::new(registry);
        let sensor = registry.sensor(ids::ACCELEROMETER).unwrap();
        sensor.enable(true).unwrap();

        let coordinator =
            DeliveryIntervalCoordinator::new(registry.clone(), Duration::from_millis(5000));

        assert!(coordinator.set_interval(Duration::from_millis(1000)));
        let starts = sensor.subscription_starts();

        // Same value again: absorbed before reaching any sensor.
        assert!(!coordinator.set_interval(Duration::from_millis(1000)));
        assert_eq!(sensor.subscription_starts(), starts);
        assert_eq!(coordinator.current(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_change_reaches_disabled_sensors() {
        let mut registry = SensorRegistry::new(Duration::from_millis(5000), true);
        registry.register("Gyroscope", Arc::new(MotionDriver::gyroscope()));
        let registry = Arc::new(registry);
        let sensor = registry.sensor(ids::GYROSCOPE).unwrap();

        let coordinator =
            DeliveryIntervalCoordinator::new(registry.clone(), Duration::from_millis(5000));
        coordinator.set_interval(Duration::from_millis(250));

        assert_eq!(sensor.interval(), Duration::from_millis(250));
        assert!(!sensor.is_enabled());
    }
}
