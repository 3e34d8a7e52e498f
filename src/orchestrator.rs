//! The orchestrator: owns every runtime thread and the lifecycle state
//! machine, and runs the supervisory loop.
//!
//! Lifecycle is STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED under
//! one lock. Start order is device manager, then workers, then sensors;
//! stop order is device manager, then sensors so no new data is produced,
//! then workers, then the final journal flush.

use crate::context::Context;
use crate::diagnostics;
use crate::error::{EdgekitError, Result};
use crate::factory::TreeFactoryRegistry;
use crate::health::{DeviceHealth, NullLogSource};
use crate::manager::{Connectivity, DeviceManager, DeviceManagerConfig, PlatformHook};
use crate::node::Stream;
use crate::cloud::CloudConnector;
use crate::record::{
    FileNaming, Format, SensorType, StorageTier, HEART_TYPE_ID, SCORE_STREAM_INDEX,
    SCORE_TYPE_ID, SCORP_STREAM_INDEX, SCORP_TYPE_ID, WARNING_TYPE_ID,
};
use crate::sensor::{FailurePolicy, SensorRunner};
use crate::stats::StatTracker;
use crate::sync::StopToken;
use crate::tree::DPtree;
use crate::worker::{fair_for_tree, DPworker, WorkerConfig};
use crate::node::SensorCfg;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for OrchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchState::Stopped => "STOPPED",
            OrchState::Starting => "STARTING",
            OrchState::Running => "RUNNING",
            OrchState::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorStatus {
    pub state: OrchState,
    pub sensors_alive: usize,
    pub sensors_total: usize,
    pub workers_alive: usize,
    pub workers_total: usize,
    pub pending_transfers: usize,
}

#[derive(Default)]
struct Inner {
    state: Option<OrchState>,
    sensors: Vec<SensorRunner>,
    workers: Vec<DPworker>,
    manager: Option<DeviceManager>,
    journal_sync: Option<(StopToken, JoinHandle<()>)>,
}

impl Inner {
    fn state(&self) -> OrchState {
        self.state.unwrap_or(OrchState::Stopped)
    }
}

pub struct EdgeOrchestrator {
    context: Arc<Context>,
    registry: TreeFactoryRegistry,
    connectivity: Arc<dyn Connectivity>,
    hook: Arc<dyn PlatformHook>,
    inner: Mutex<Inner>,
}

impl EdgeOrchestrator {
    pub fn new(
        context: Arc<Context>,
        registry: TreeFactoryRegistry,
        connectivity: Arc<dyn Connectivity>,
        hook: Arc<dyn PlatformHook>,
    ) -> Self {
        Self {
            context,
            registry,
            connectivity,
            hook,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Build the device's trees plus the internal system trees.
    fn load_trees(&self) -> Result<Vec<DPtree>> {
        let mut trees = self.registry.build(&self.context.config)?;
        trees.extend(self.system_trees());
        Ok(trees)
    }

    fn system_trees(&self) -> Vec<DPtree> {
        let cfg = &self.context.config;
        let system_container = cfg.device.cc_for_system_records.clone();
        let heartbeat = Duration::from_secs(cfg.device.heart_beat_frequency_secs);

        let system_stream = |type_id: &str, index: u32| Stream {
            type_id: type_id.into(),
            index,
            format: Format::Df,
            naming: FileNaming::Default,
            tier: StorageTier::Hot,
            cloud_container: Some(system_container.clone()),
            sample_probability: 1.0,
            description: String::new(),
        };

        let heart_stream = system_stream(HEART_TYPE_ID, 0);
        let warning_stream = system_stream(WARNING_TYPE_ID, 0);
        let health_tree = DPtree::new(
            SensorCfg {
                sensor_type: SensorType::Sys,
                type_id: HEART_TYPE_ID.into(),
                sensor_index: 0,
                description: "device health telemetry".into(),
                outputs: vec![heart_stream.clone(), warning_stream.clone()],
            },
            Box::new(DeviceHealth::new(
                Arc::clone(&self.context.health),
                Arc::clone(&self.context.ping),
                Box::new(NullLogSource),
                heart_stream,
                warning_stream,
                heartbeat,
            )),
        );

        let scorp_stream = system_stream(SCORP_TYPE_ID, SCORP_STREAM_INDEX);
        let score_stream = system_stream(SCORE_TYPE_ID, SCORE_STREAM_INDEX);
        let stats_tree = DPtree::new(
            SensorCfg {
                sensor_type: SensorType::Sys,
                type_id: SCORE_TYPE_ID.into(),
                sensor_index: 0,
                description: "output statistics".into(),
                outputs: vec![scorp_stream.clone(), score_stream.clone()],
            },
            Box::new(StatTracker::new(
                self.context.stats.clone(),
                score_stream,
                scorp_stream,
                heartbeat,
            )),
        );

        vec![health_tree, stats_tree]
    }

    /// Start everything: device manager, journal sync, workers, sensors.
    /// A warned no-op when not currently stopped.
    pub fn start_all(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state() != OrchState::Stopped {
                warn!("start_all in state {}; ignoring", inner.state());
                return Ok(());
            }
            inner.state = Some(OrchState::Starting);
        }
        info!("Starting edge runtime");
        let mut started = Inner::default();
        let result = self.spawn_components(&mut started);
        match &result {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.sensors = std::mem::take(&mut started.sensors);
                inner.workers = std::mem::take(&mut started.workers);
                inner.manager = started.manager.take();
                inner.journal_sync = started.journal_sync.take();
                inner.state = Some(OrchState::Running);
                info!(
                    "Edge runtime running ({} sensors, {} workers)",
                    inner.sensors.len(),
                    inner.workers.len()
                );
            }
            Err(e) => {
                // A half-started runtime must not leak threads.
                error!("Start failed: {e}; stopping partially started components");
                Self::halt_components(&mut started);
                self.inner.lock().state = Some(OrchState::Stopped);
            }
        }
        result
    }

    /// Spawn every component into `started` as it comes up, so a mid-start
    /// failure can be unwound by `halt_components`.
    fn spawn_components(&self, started: &mut Inner) -> Result<()> {
        let ctx = &self.context;
        let cfg = &ctx.config;
        let trees = self.load_trees()?;

        started.manager = Some(DeviceManager::spawn(
            DeviceManagerConfig {
                check_period: Duration::from_secs(cfg.timing.connectivity_check_secs),
                outage_limit: Duration::from_secs(cfg.thresholds.connectivity_reboot_hours * 3600),
                manage_leds: cfg.device.manage_leds,
                diags_dir: cfg.paths.diags_dir(),
                diags_container: cfg.device.cc_for_diagnostics.clone(),
                device_id: cfg.device.device_id.clone(),
                config_dump: ctx.config_dump(),
            },
            Arc::clone(&self.connectivity),
            Arc::clone(&self.hook),
            Arc::clone(&ctx.ping),
            Arc::clone(&ctx.engine),
        )?);

        let sync_stop = StopToken::new();
        let sync_handle = ctx.journals.start_sync_thread(
            sync_stop.clone(),
            Duration::from_secs(cfg.timing.journal_sync_secs),
        )?;
        started.journal_sync = Some((sync_stop, sync_handle));

        let worker_cfg = WorkerConfig {
            tick: Duration::from_secs(cfg.timing.worker_tick_secs),
            stale_guard: Duration::from_secs(cfg.thresholds.stale_file_guard_secs),
            fair_container: cfg.device.cc_for_fair.clone(),
        };
        let policy = FailurePolicy {
            max_consecutive_failures: cfg.thresholds.sensor_max_consecutive_failures,
            backoff: Duration::from_secs(cfg.thresholds.sensor_failure_backoff_secs),
        };
        let max_recording_timer = Duration::from_secs(cfg.device.max_recording_timer_secs);

        let mut pending_sensors = Vec::new();
        for mut tree in trees {
            let sensor_cfg = tree.sensor_cfg().clone();
            let io = Arc::new(ctx.node_io(sensor_cfg.sensor_index, tree.consumed_streams()));
            let sensor = tree.take_sensor().ok_or_else(|| {
                EdgekitError::component(
                    "orchestrator".to_string(),
                    format!("tree {} has no sensor", sensor_cfg.type_id),
                )
            })?;
            let fair = fair_for_tree(
                &tree,
                &cfg.device,
                cfg.fleet_map(),
                ctx.engine.connector().account_name(),
            );

            // Workers come up before sensors so staged data is never orphaned.
            if tree.processor_count() > 0 {
                started.workers.push(DPworker::spawn(
                    tree,
                    Arc::clone(&io),
                    worker_cfg.clone(),
                    fair,
                )?);
            }
            pending_sensors.push((sensor_cfg, sensor, io));
        }

        for (sensor_cfg, sensor, io) in pending_sensors {
            started.sensors.push(SensorRunner::spawn(
                &format!("{}-{}", sensor_cfg.type_id.to_lowercase(), sensor_cfg.sensor_index),
                sensor,
                io,
                Arc::clone(&ctx.health),
                ctx.signals.clone(),
                policy,
                max_recording_timer,
            )?);
        }

        ctx.signals.running.raise()?;
        Ok(())
    }

    /// Stop and join components: device manager first, then sensors, then
    /// workers, then the journal sync thread (which flushes once more on its
    /// way out).
    fn halt_components(started: &mut Inner) {
        if let Some(mut manager) = started.manager.take() {
            manager.request_stop();
            manager.join();
        }
        for sensor in &started.sensors {
            sensor.request_stop();
        }
        for sensor in &mut started.sensors {
            sensor.join();
        }
        started.sensors.clear();
        for worker in &started.workers {
            worker.request_stop();
        }
        for worker in &mut started.workers {
            worker.join();
        }
        started.workers.clear();
        if let Some((sync_stop, handle)) = started.journal_sync.take() {
            sync_stop.request_stop();
            if handle.join().is_err() {
                error!("Journal sync thread panicked");
            }
        }
    }

    /// Stop everything. Flag files are settled per intent: a restart clears
    /// the stop and restart flags and keeps the running marker up so the
    /// watchdog does not count the gap as a death; a final stop clears the
    /// restart flag and drops the running marker.
    pub fn stop_all(&self, restart: bool) -> Result<()> {
        let mut taken = {
            let mut inner = self.inner.lock();
            if inner.state() != OrchState::Running {
                warn!("stop_all in state {}; resetting", inner.state());
                inner.sensors.clear();
                inner.workers.clear();
                inner.manager = None;
                inner.journal_sync = None;
                inner.state = Some(OrchState::Stopped);
                return Ok(());
            }
            inner.state = Some(OrchState::Stopping);
            Inner {
                state: None,
                sensors: std::mem::take(&mut inner.sensors),
                workers: std::mem::take(&mut inner.workers),
                manager: inner.manager.take(),
                journal_sync: inner.journal_sync.take(),
            }
        };
        info!("Stopping edge runtime (restart: {restart})");
        if restart {
            self.context.signals.stop.clear();
        }
        self.context.signals.restart.clear();

        Self::halt_components(&mut taken);

        if let Err(e) = self.context.journals.sync() {
            warn!("Final journal flush failed: {e}");
        }
        if !restart {
            self.context.signals.running.clear();
        }
        self.inner.lock().state = Some(OrchState::Stopped);
        info!("Edge runtime stopped");
        Ok(())
    }

    pub fn status(&self) -> OrchestratorStatus {
        let inner = self.inner.lock();
        OrchestratorStatus {
            state: inner.state(),
            sensors_alive: inner.sensors.iter().filter(|s| s.is_alive()).count(),
            sensors_total: inner.sensors.len(),
            workers_alive: inner.workers.iter().filter(|w| w.is_alive()).count(),
            workers_total: inner.workers.len(),
            pending_transfers: self.context.engine.pending(),
        }
    }

    /// Whether an orchestrator (this process or another) looks alive: the
    /// liveness marker exists, is fresh, and postdates any stop request.
    pub fn watchdog_file_alive(&self) -> bool {
        let signals = &self.context.signals;
        let Some(age) = signals.running.age_secs() else {
            return false;
        };
        let limit = 2 * self.context.config.timing.watchdog_frequency_secs as i64;
        if age > limit {
            return false;
        }
        if let (Some(running_at), Some(stop_at)) =
            (signals.running.raised_at(), signals.stop.raised_at())
        {
            if running_at < stop_at {
                return false;
            }
        }
        true
    }

    /// The supervisory loop: touch the liveness marker every tick, honor the
    /// stop and restart flags, and escalate memory pressure. Returns after a
    /// guaranteed `stop_all`.
    pub fn run_supervised(&self, stop: &StopToken) -> Result<()> {
        self.start_all()?;
        let tick = Duration::from_secs(self.context.config.timing.watchdog_frequency_secs);
        let signals = self.context.signals.clone();

        loop {
            if let Err(e) = signals.running.raise() {
                warn!("Could not touch liveness marker: {e}");
            }
            if let Ok(status) = serde_json::to_string(&self.status()) {
                tracing::debug!("status {status}");
            }

            if signals.stop.is_set() {
                info!("Stop flag raised; shutting down");
                signals.stop.clear();
                break;
            }

            if signals.restart.is_set() {
                warn!("Restart flag raised; restarting all components");
                signals.restart.clear();
                self.stop_all(true)?;
                self.start_all()?;
            }

            if self.context.health.memory_pressure_critical() {
                let reason = "memory pressure above reboot threshold";
                if let Err(e) = diagnostics::collect(
                    &self.context.config.paths.diags_dir(),
                    &self.context.config.device.device_id,
                    reason,
                    &self.context.config_dump(),
                    &format!("memory: {:.1}%", self.context.health.memory_used_percent()),
                ) {
                    warn!("Could not capture diagnostics: {e}");
                }
                if let Err(e) = self.hook.reboot(reason) {
                    error!("Reboot hook failed: {e}");
                }
                break;
            }

            if stop.wait(tick) {
                break;
            }
        }

        self.stop_all(false)
    }
}
