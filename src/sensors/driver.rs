//! Sensor data sources.
//!
//! A [`SensorDriver`] is the per-kind external collaborator behind a
//! [`Sensor`](super::Sensor): a hardware-style subscription that pushes
//! periodic structured samples, plus a synthetic sample generator used when
//! the sensor runs in simulated mode.
//!
//! The hardware subscriptions here produce deterministic waveforms rather
//! than real platform readings, so the agent runs anywhere; a platform port
//! swaps in drivers backed by the native sensor APIs.

use super::SensorReading;
use crate::error::{AgentError, Result};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub trait SensorDriver: Send + Sync {
    /// Field name this sensor reports under in outbound telemetry.
    fn telemetry_field(&self) -> &str;

    /// Open a hardware-style subscription delivering one sample per interval
    /// into `tx`. Fails if the underlying data source cannot be reached.
    fn open(&self, interval: Duration, tx: mpsc::Sender<SensorReading>) -> Result<DriverSubscription>;

    /// Produce one synthetic sample (simulated mode).
    fn synthesize(&self) -> SensorReading;
}

/// Live hardware-style subscription.
///
/// The sampling cadence can be re-tuned in place without tearing the
/// subscription down; already-buffered samples are not dropped.
pub struct DriverSubscription {
    handle: JoinHandle<()>,
    interval_ms: Arc<AtomicU64>,
}

impl DriverSubscription {
    fn new(handle: JoinHandle<()>, interval_ms: Arc<AtomicU64>) -> Self {
        Self { handle, interval_ms }
    }

    /// Change the sampling cadence of the running subscription.
    pub fn retune(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    /// Tear the subscription down. No samples are delivered afterwards.
    pub fn close(&self) {
        self.handle.abort();
    }
}

impl Drop for DriverSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn spawn_sampler<F>(interval: Duration, tx: mpsc::Sender<SensorReading>, mut sample: F) -> DriverSubscription
where
    F: FnMut() -> SensorReading + Send + 'static,
{
    let interval_ms = Arc::new(AtomicU64::new(interval.as_millis() as u64));
    let period = interval_ms.clone();
    let handle = tokio::spawn(async move {
        loop {
            let ms = period.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if tx.send(sample()).await.is_err() {
                break;
            }
        }
    });
    DriverSubscription::new(handle, interval_ms)
}

/// 3-axis motion driver (accelerometer, gyroscope, magnetometer).
///
/// Hardware mode emits a smooth waveform; simulated mode emits random
/// triples within the amplitude.
pub struct MotionDriver {
    field: String,
    amplitude: f64,
    phase_step: f64,
}

impl MotionDriver {
    pub fn new(field: impl Into<String>, amplitude: f64, phase_step: f64) -> Self {
        Self {
            field: field.into(),
            amplitude,
            phase_step,
        }
    }

    pub fn accelerometer() -> Self {
        Self::new(super::ids::ACCELEROMETER, 9.8, 0.15)
    }

    pub fn gyroscope() -> Self {
        Self::new(super::ids::GYROSCOPE, 2.0, 0.3)
    }

    pub fn magnetometer() -> Self {
        Self::new(super::ids::MAGNETOMETER, 60.0, 0.05)
    }
}

impl SensorDriver for MotionDriver {
    fn telemetry_field(&self) -> &str {
        &self.field
    }

    fn open(&self, interval: Duration, tx: mpsc::Sender<SensorReading>) -> Result<DriverSubscription> {
        let amplitude = self.amplitude;
        let step = self.phase_step;
        let mut phase = 0.0_f64;
        Ok(spawn_sampler(interval, tx, move || {
            phase += step;
            SensorReading::Vector {
                x: amplitude * phase.sin(),
                y: amplitude * phase.cos(),
                z: amplitude * (phase / 2.0).sin(),
            }
        }))
    }

    fn synthesize(&self) -> SensorReading {
        let mut rng = rand::thread_rng();
        SensorReading::Vector {
            x: rng.gen_range(-self.amplitude..self.amplitude),
            y: rng.gen_range(-self.amplitude..self.amplitude),
            z: rng.gen_range(-self.amplitude..self.amplitude),
        }
    }
}

/// Scalar driver (barometer, battery level).
pub struct ScalarDriver {
    field: String,
    base: f64,
    spread: f64,
}

impl ScalarDriver {
    pub fn new(field: impl Into<String>, base: f64, spread: f64) -> Self {
        Self {
            field: field.into(),
            base,
            spread,
        }
    }

    pub fn barometer() -> Self {
        Self::new(super::ids::BAROMETER, 1013.25, 4.0)
    }

    pub fn battery() -> Self {
        Self::new(super::ids::BATTERY, 80.0, 15.0)
    }
}

impl SensorDriver for ScalarDriver {
    fn telemetry_field(&self) -> &str {
        &self.field
    }

    fn open(&self, interval: Duration, tx: mpsc::Sender<SensorReading>) -> Result<DriverSubscription> {
        let base = self.base;
        let spread = self.spread;
        let mut phase = 0.0_f64;
        Ok(spawn_sampler(interval, tx, move || {
            phase += 0.1;
            SensorReading::Scalar(base + spread * phase.sin())
        }))
    }

    fn synthesize(&self) -> SensorReading {
        let mut rng = rand::thread_rng();
        SensorReading::Scalar(self.base + rng.gen_range(-self.spread..self.spread))
    }
}

/// Geolocation driver: random walk around a fixed origin.
pub struct GeoDriver {
    origin_lat: f64,
    origin_lon: f64,
}

impl GeoDriver {
    pub fn new(origin_lat: f64, origin_lon: f64) -> Self {
        Self {
            origin_lat,
            origin_lon,
        }
    }
}

impl Default for GeoDriver {
    fn default() -> Self {
        // Somewhere in the North Sea; overridden by platform drivers.
        Self::new(54.5, 3.5)
    }
}

impl SensorDriver for GeoDriver {
    fn telemetry_field(&self) -> &str {
        super::ids::GEOLOCATION
    }

    fn open(&self, interval: Duration, tx: mpsc::Sender<SensorReading>) -> Result<DriverSubscription> {
        let mut lat = self.origin_lat;
        let mut lon = self.origin_lon;
        Ok(spawn_sampler(interval, tx, move || {
            let mut rng = rand::thread_rng();
            lat += rng.gen_range(-0.0005..0.0005);
            lon += rng.gen_range(-0.0005..0.0005);
            SensorReading::Geo { lat, lon }
        }))
    }

    fn synthesize(&self) -> SensorReading {
        let mut rng = rand::thread_rng();
        SensorReading::Geo {
            lat: self.origin_lat + rng.gen_range(-0.01..0.01),
            lon: self.origin_lon + rng.gen_range(-0.01..0.01),
        }
    }
}

/// Driver whose hardware data source can never be reached.
///
/// A sensor backed by this driver fails to start in hardware mode and stays
/// disabled; simulated mode still works. Mirrors a platform sensor that is
/// absent from the host device.
pub struct UnreachableDriver {
    field: String,
}

impl UnreachableDriver {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl SensorDriver for UnreachableDriver {
    fn telemetry_field(&self) -> &str {
        &self.field
    }

    fn open(&self, _interval: Duration, _tx: mpsc::Sender<SensorReading>) -> Result<DriverSubscription> {
        Err(AgentError::SensorUnavailable(self.field.clone()))
    }

    fn synthesize(&self) -> SensorReading {
        SensorReading::Scalar(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_motion_driver_delivers_samples() {
        let driver = MotionDriver::accelerometer();
        let (tx, mut rx) = mpsc::channel(8);
        let sub = driver.open(Duration::from_millis(10), tx).unwrap();

        let sample = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("sample within deadline")
            .expect("channel open");
        assert!(matches!(sample, SensorReading::Vector { .. }));

        sub.close();
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_delivery() {
        let driver = ScalarDriver::barometer();
        let (tx, mut rx) = mpsc::channel(8);
        let sub = driver.open(Duration::from_millis(10), tx).unwrap();
        sub.close();

        // Drain whatever was in flight, then expect silence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unreachable_driver_fails_to_open() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let driver = UnreachableDriver::new("missing");
            let (tx, _rx) = mpsc::channel(1);
            assert!(driver.open(Duration::from_millis(10), tx).is_err());
        });
    }
}
