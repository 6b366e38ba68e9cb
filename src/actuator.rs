//! Local actuator abstraction.
//!
//! Remote commands can trigger a time-bounded side effect on the device,
//! such as pulsing a torch LED, buzzer, or relay. The core only needs
//! start/await-completion semantics; the concrete actuator is pluggable.

use crate::error::Result;
use async_trait::async_trait;
use log::info;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[async_trait]
pub trait Actuator: Send + Sync {
    /// Pulse the actuator `pulses` times, holding each pulse for `duration`
    /// with `delay` between pulses. Resolves when the full sequence is done.
    async fn pulse(&self, pulses: u32, duration: Duration, delay: Duration) -> Result<()>;
}

/// Default actuator: drives a boolean "on" state through timed pulses.
///
/// Stands in for a hardware peripheral (torch, buzzer, relay). The current
/// state and completed pulse count are observable for diagnostics and tests.
pub struct PulseActuator {
    on: AtomicBool,
    completed_pulses: AtomicU32,
}

impl PulseActuator {
    pub fn new() -> Self {
        Self {
            on: AtomicBool::new(false),
            completed_pulses: AtomicU32::new(0),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    pub fn completed_pulses(&self) -> u32 {
        self.completed_pulses.load(Ordering::SeqCst)
    }
}

impl Default for PulseActuator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actuator for PulseActuator {
    async fn pulse(&self, pulses: u32, duration: Duration, delay: Duration) -> Result<()> {
        for n in 0..pulses {
            self.on.store(true, Ordering::SeqCst);
            info!("[Actuator] Pulse {}/{} on", n + 1, pulses);
            tokio::time::sleep(duration).await;
            self.on.store(false, Ordering::SeqCst);
            self.completed_pulses.fetch_add(1, Ordering::SeqCst);
            if n + 1 < pulses {
                tokio::time::sleep(delay).await;
            }
        }
        info!("[Actuator] Pulse sequence complete ({} pulses)", pulses);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pulse_sequence_completes() {
        let actuator = PulseActuator::new();
        actuator
            .pulse(
                3,
                Duration::from_millis(5),
                Duration::from_millis(5),
            )
            .await
            .unwrap();

        assert!(!actuator.is_on());
        assert_eq!(actuator.completed_pulses(), 3);
    }
}
