//! One sensor behind the uniform enable/interval/simulate contract.
//!
//! Enabling starts a data-producing subscription matching the current
//! simulation mode; disabling tears it down. A generation counter
//! invalidates stale subscription tasks, so a torn-down subscription can
//! never emit into the listener hub — there is at most one live
//! subscription per sensor at any time.

use super::driver::{DriverSubscription, SensorDriver};
use super::registry::{EventKind, ListenerHub};
use crate::error::Result;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ActiveRun {
    pump: JoinHandle<()>,
    /// Present in hardware mode only; simulated mode generates its own ticks.
    driver_sub: Option<DriverSubscription>,
}

struct SensorState {
    enabled: bool,
    simulated: bool,
    interval: Duration,
    run: Option<ActiveRun>,
}

pub struct Sensor {
    id: String,
    display_name: String,
    driver: Arc<dyn SensorDriver>,
    hub: Arc<ListenerHub>,
    /// Bumped on every subscription start and teardown; emission tasks carry
    /// the value current at their start and go silent once it moves on.
    generation: Arc<AtomicU64>,
    /// Counts subscription starts, for resubscribe accounting.
    starts: AtomicU64,
    state: Mutex<SensorState>,
}

impl Sensor {
    /// Construct a disabled sensor. The id is the driver's telemetry field
    /// name, stable for the life of the process.
    pub fn new(
        display_name: impl Into<String>,
        driver: Arc<dyn SensorDriver>,
        hub: Arc<ListenerHub>,
        interval: Duration,
        simulated: bool,
    ) -> Self {
        Self {
            id: driver.telemetry_field().to_string(),
            display_name: display_name.into(),
            driver,
            hub,
            generation: Arc::new(AtomicU64::new(0)),
            starts: AtomicU64::new(0),
            state: Mutex::new(SensorState {
                enabled: false,
                simulated,
                interval,
                run: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn is_simulated(&self) -> bool {
        self.state.lock().simulated
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    /// Number of subscription starts over the sensor's lifetime.
    pub fn subscription_starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Switch the sensor on or off. Idempotent. Enabling starts a
    /// subscription appropriate to the current simulation mode; if the data
    /// source cannot be reached the sensor stays disabled and the error is
    /// returned.
    pub fn enable(&self, flag: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.enabled == flag {
            return Ok(());
        }
        if flag {
            self.start_run(&mut state)?;
            state.enabled = true;
            debug!("[Sensor] {} enabled", self.id);
        } else {
            self.stop_run(&mut state);
            state.enabled = false;
            debug!("[Sensor] {} disabled", self.id);
        }
        Ok(())
    }

    /// Update the sampling cadence. No-op if unchanged. Hardware mode
    /// re-tunes the live subscription in place; simulated mode re-arms its
    /// periodic timer at the new period (exactly one resubscribe).
    pub fn send_interval(&self, interval: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if state.interval == interval {
            return Ok(());
        }
        state.interval = interval;
        if !state.enabled {
            return Ok(());
        }
        if state.simulated {
            self.stop_run(&mut state);
            self.start_run(&mut state)?;
        } else if let Some(run) = &state.run
            && let Some(sub) = &run.driver_sub
        {
            sub.retune(interval);
        }
        Ok(())
    }

    /// Switch between the hardware and simulated data source. No-op if
    /// unchanged. While enabled this is one atomic resubscribe cycle: the
    /// old subscription is invalidated before the new one starts, so
    /// consumers never see double emission. If the hardware source cannot
    /// be reached when switching out of simulation, the sensor ends up
    /// disabled.
    pub fn simulate(&self, flag: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.simulated == flag {
            return Ok(());
        }
        state.simulated = flag;
        if state.enabled {
            self.stop_run(&mut state);
            if let Err(e) = self.start_run(&mut state) {
                state.enabled = false;
                warn!("[Sensor] {} stayed disabled after mode switch: {}", self.id, e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn start_run(&self, state: &mut SensorState) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let run = if state.simulated {
            let hub = self.hub.clone();
            let driver = self.driver.clone();
            let id = self.id.clone();
            let live = self.generation.clone();
            let period = state.interval;
            let pump = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if live.load(Ordering::SeqCst) != generation {
                        break;
                    }
                    hub.dispatch(&id, EventKind::DataAvailable, &driver.synthesize());
                }
            });
            ActiveRun {
                pump,
                driver_sub: None,
            }
        } else {
            let (tx, mut rx) = mpsc::channel(16);
            let sub = self.driver.open(state.interval, tx)?;
            let hub = self.hub.clone();
            let id = self.id.clone();
            let live = self.generation.clone();
            let pump = tokio::spawn(async move {
                while let Some(reading) = rx.recv().await {
                    if live.load(Ordering::SeqCst) != generation {
                        break;
                    }
                    hub.dispatch(&id, EventKind::DataAvailable, &reading);
                }
            });
            ActiveRun {
                pump,
                driver_sub: Some(sub),
            }
        };
        state.run = Some(run);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_run(&self, state: &mut SensorState) {
        // Invalidate before aborting so a task mid-poll cannot emit.
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(run) = state.run.take() {
            run.pump.abort();
            if let Some(sub) = run.driver_sub {
                sub.close();
            }
        }
    }

    /// Whether a subscription is currently live. Holds iff enabled.
    pub fn has_active_subscription(&self) -> bool {
        self.state.lock().run.is_some()
    }
}
