//! Sensor seam and the thread that runs one sensor.
//!
//! A sensor's `run` owns its device loop and is expected to poll
//! `SensorControl::continue_recording` between observations. The runner
//! restarts a failed sensor with backoff; a sensor that keeps failing raises
//! the device restart flag and exits rather than stopping the runtime from
//! inside a sensor thread.

use crate::error::Result;
use crate::health::HealthMonitor;
use crate::node::NodeIo;
use crate::signals::SignalSet;
use crate::sync::StopToken;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub trait Sensor: Send {
    /// Run the sensor loop until `ctl` reports a stop request. Returning
    /// `Ok` before a stop request is treated as a completed cycle and the
    /// sensor is invoked again.
    fn run(&mut self, ctl: &SensorControl, io: &NodeIo) -> Result<()>;
}

/// How often a throttled producer re-checks disk pressure while it waits.
const PRESSURE_RECHECK: Duration = Duration::from_secs(1);

/// Control surface handed to a running sensor.
pub struct SensorControl {
    stop: StopToken,
    health: Arc<HealthMonitor>,
    signals: SignalSet,
    max_recording_timer: Duration,
}

impl SensorControl {
    pub fn new(
        stop: StopToken,
        health: Arc<HealthMonitor>,
        signals: SignalSet,
        max_recording_timer: Duration,
    ) -> Self {
        Self {
            stop,
            health,
            signals,
            max_recording_timer,
        }
    }

    /// Gate checked between observations: false on stop request. Under disk
    /// pressure the producer is held here, re-checking until space frees up
    /// or the recording-timer budget runs out, so consumers and uploads can
    /// catch up instead of the backlog growing.
    pub fn continue_recording(&self) -> bool {
        if self.stop.is_stop_requested() {
            return false;
        }
        if !self.health.disk_pressure() {
            return true;
        }
        let deadline = Instant::now() + self.max_recording_timer;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.stop.wait(remaining.min(PRESSURE_RECHECK)) {
                return false;
            }
            if !self.health.disk_pressure() {
                return true;
            }
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Sleep that wakes early on a stop request; returns true when stopping.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.stop.wait(timeout)
    }

    /// Duration of a pending on-demand sensing request, if one is raised.
    pub fn trigger_duration(&self) -> Option<u64> {
        self.signals.trigger_duration_secs()
    }

    /// Acknowledge and clear a pending on-demand trigger.
    pub fn clear_trigger(&self) {
        self.signals.trigger.clear();
    }
}

/// Burst hook for sensors that record only when asked to.
pub trait TriggeredSensor: Send {
    /// Record for up to `duration`; called once per raised trigger.
    fn sensing_triggered(
        &mut self,
        duration: Duration,
        ctl: &SensorControl,
        io: &NodeIo,
    ) -> Result<()>;
}

/// On-demand sensor loop: idles until the trigger flag is raised (carrying a
/// requested duration in seconds), runs one burst, waits out whatever the
/// burst left of the requested window, then clears the trigger.
pub struct OnDemandSensor<T> {
    inner: T,
    poll: Duration,
}

impl<T: TriggeredSensor> OnDemandSensor<T> {
    pub fn new(inner: T, poll: Duration) -> Self {
        Self { inner, poll }
    }
}

impl<T: TriggeredSensor> Sensor for OnDemandSensor<T> {
    fn run(&mut self, ctl: &SensorControl, io: &NodeIo) -> Result<()> {
        loop {
            if let Some(secs) = ctl.trigger_duration() {
                let duration = Duration::from_secs(secs);
                info!("Sensing trigger raised for {secs}s");
                let started = Instant::now();
                let result = self.inner.sensing_triggered(duration, ctl, io);
                let remaining = duration.saturating_sub(started.elapsed());
                if !remaining.is_zero() {
                    ctl.wait(remaining);
                }
                ctl.clear_trigger();
                result?;
            }
            if ctl.wait(self.poll) {
                return Ok(());
            }
        }
    }
}

/// Failure policy for one sensor thread.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    pub max_consecutive_failures: u32,
    pub backoff: Duration,
}

/// Owns one sensor thread and its stop token.
pub struct SensorRunner {
    name: String,
    stop: StopToken,
    handle: Option<JoinHandle<()>>,
}

impl SensorRunner {
    pub fn spawn(
        name: &str,
        mut sensor: Box<dyn Sensor>,
        io: Arc<NodeIo>,
        health: Arc<HealthMonitor>,
        signals: SignalSet,
        policy: FailurePolicy,
        max_recording_timer: Duration,
    ) -> std::io::Result<Self> {
        let stop = StopToken::new();
        let ctl = SensorControl::new(stop.clone(), health, signals.clone(), max_recording_timer);
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("sensor-{name}"))
            .spawn(move || {
                info!("Sensor {thread_name} started");
                let mut consecutive_failures: u32 = 0;
                while !ctl.stop_requested() {
                    match sensor.run(&ctl, &io) {
                        Ok(()) => {
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                "Sensor {thread_name} failed (attempt {consecutive_failures}): {e}"
                            );
                            io.log_warning(&format!("sensor {thread_name} failed: {e}"));
                            if consecutive_failures >= policy.max_consecutive_failures {
                                // Raising the restart flag is all we do here:
                                // a sensor thread must never drive a full stop
                                // itself, the supervisory loop handles it.
                                error!(
                                    "Sensor {thread_name} failed {consecutive_failures} times; requesting device restart"
                                );
                                if let Err(e) = signals.restart.raise() {
                                    error!("Could not raise restart flag: {e}");
                                }
                                break;
                            }
                            if ctl.wait(policy.backoff) {
                                break;
                            }
                        }
                    }
                }
                info!("Sensor {thread_name} stopped");
            })?;
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Join the sensor thread, guarding against a sensor joining itself.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                warn!("Sensor {} attempted to join itself; skipping", self.name);
                return;
            }
            if handle.join().is_err() {
                error!("Sensor {} thread panicked", self.name);
            }
        }
    }
}
