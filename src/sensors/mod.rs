//! Sensor fleet: capability contract, data sources, and listener dispatch.
//!
//! Every sensor — hardware-backed or simulated — sits behind the same
//! enable/interval/simulate contract and emits telemetry events through the
//! registry's listener hub.

pub mod driver;
pub mod interval;
pub mod registry;
pub mod sensor;

pub use driver::{DriverSubscription, GeoDriver, MotionDriver, ScalarDriver, SensorDriver};
pub use interval::DeliveryIntervalCoordinator;
pub use registry::{EventKind, ListenerToken, SensorRegistry};
pub use sensor::Sensor;

use serde::{Deserialize, Serialize};

/// Well-known sensor ids, stable within the registry.
pub mod ids {
    pub const ACCELEROMETER: &str = "accelerometer";
    pub const GYROSCOPE: &str = "gyroscope";
    pub const MAGNETOMETER: &str = "magnetometer";
    pub const BAROMETER: &str = "barometer";
    pub const BATTERY: &str = "battery";
    pub const GEOLOCATION: &str = "geolocation";
}

/// One sensor sample. The variant shape is fixed per sensor kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorReading {
    /// 3-axis vector (motion sensors).
    Vector { x: f64, y: f64, z: f64 },
    /// Geographic fix.
    Geo { lat: f64, lon: f64 },
    /// Plain scalar (barometer, battery level).
    Scalar(f64),
}
