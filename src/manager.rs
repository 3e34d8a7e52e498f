//! Device manager: periodic connectivity checks, LED status, and the
//! prolonged-outage escalation path.
//!
//! Network probing, LED wiring and the actual reboot are platform concerns
//! behind the `Connectivity` and `PlatformHook` traits; the manager owns the
//! policy (failure counting, outage timing, diagnostics-before-reboot).

use crate::cloud::AsyncCloudConnector;
use crate::diagnostics;
use crate::error::Result;
use crate::health::PingStats;
use crate::sync::StopToken;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ConnectivityReport {
    pub online: bool,
    pub packet_loss_percent: f32,
    pub ip_address: Option<String>,
}

pub trait Connectivity: Send + Sync {
    fn check(&self) -> ConnectivityReport;
}

/// Default for hosts with no network probe wired up.
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn check(&self) -> ConnectivityReport {
        ConnectivityReport {
            online: true,
            packet_loss_percent: 0.0,
            ip_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedStatus {
    Running,
    Offline,
    Stopping,
}

pub trait PlatformHook: Send + Sync {
    fn reboot(&self, reason: &str) -> Result<()>;
    fn set_led(&self, status: LedStatus) -> Result<()>;
}

/// Logs instead of acting; the default for development hosts.
pub struct NoopPlatform;

impl PlatformHook for NoopPlatform {
    fn reboot(&self, reason: &str) -> Result<()> {
        warn!("Reboot requested ({reason}) but no platform hook is installed");
        Ok(())
    }

    fn set_led(&self, _status: LedStatus) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    pub check_period: Duration,
    /// Continuous offline time after which the device reboots itself.
    pub outage_limit: Duration,
    pub manage_leds: bool,
    pub diags_dir: PathBuf,
    pub diags_container: String,
    pub device_id: String,
    /// TOML dump of the running configuration, embedded in diagnostics.
    pub config_dump: String,
}

pub struct DeviceManager {
    stop: StopToken,
    handle: Option<JoinHandle<()>>,
}

impl DeviceManager {
    pub fn spawn(
        cfg: DeviceManagerConfig,
        connectivity: Arc<dyn Connectivity>,
        hook: Arc<dyn PlatformHook>,
        ping: Arc<PingStats>,
        engine: Arc<AsyncCloudConnector>,
    ) -> std::io::Result<Self> {
        let stop = StopToken::new();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("device-manager".to_string())
            .spawn(move || {
                info!("Device manager started");
                run_loop(&cfg, &*connectivity, &*hook, &ping, &engine, &thread_stop);
                if cfg.manage_leds {
                    let _ = hook.set_led(LedStatus::Stopping);
                }
                info!("Device manager stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
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

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Device manager thread panicked");
            }
        }
    }
}

fn run_loop(
    cfg: &DeviceManagerConfig,
    connectivity: &dyn Connectivity,
    hook: &dyn PlatformHook,
    ping: &PingStats,
    engine: &AsyncCloudConnector,
    stop: &StopToken,
) {
    let mut outage_start: Option<Instant> = None;
    let mut was_offline = false;

    loop {
        let report = connectivity.check();
        if report.online {
            ping.record_success(report.packet_loss_percent);
            if let Some(ip) = &report.ip_address {
                ping.set_ip_address(ip);
            }
            outage_start = None;
            if cfg.manage_leds {
                let _ = hook.set_led(LedStatus::Running);
            }
            // Bundles captured while offline go up as soon as we are back.
            if was_offline {
                info!("Connectivity restored");
            }
            if let Err(e) = diagnostics::upload_all(&cfg.diags_dir, engine, &cfg.diags_container)
            {
                warn!("Could not upload pending diagnostics: {e}");
            }
            was_offline = false;
        } else {
            let run = ping.record_failure();
            let started = *outage_start.get_or_insert_with(Instant::now);
            warn!("Connectivity check failed (run of {run})");
            if cfg.manage_leds {
                let _ = hook.set_led(LedStatus::Offline);
            }
            was_offline = true;

            if started.elapsed() >= cfg.outage_limit {
                let reason = format!(
                    "offline for {:?} (limit {:?})",
                    started.elapsed(),
                    cfg.outage_limit
                );
                if let Err(e) = diagnostics::collect(
                    &cfg.diags_dir,
                    &cfg.device_id,
                    &reason,
                    &cfg.config_dump,
                    &format!("ping fail run: {run}"),
                ) {
                    warn!("Could not capture outage diagnostics: {e}");
                }
                if let Err(e) = hook.reboot(&reason) {
                    error!("Reboot hook failed: {e}");
                }
                return;
            }
        }

        if stop.wait(cfg.check_period) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::connector::{CloudConnector, LocalCloudConnector};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct SwitchedConnectivity {
        online: Arc<AtomicBool>,
    }

    impl Connectivity for SwitchedConnectivity {
        fn check(&self) -> ConnectivityReport {
            ConnectivityReport {
                online: self.online.load(Ordering::SeqCst),
                packet_loss_percent: 0.0,
                ip_address: Some("10.0.0.2".to_string()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        rebooted: AtomicBool,
    }

    impl PlatformHook for RecordingHook {
        fn reboot(&self, _reason: &str) -> Result<()> {
            self.rebooted.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn set_led(&self, _status: LedStatus) -> Result<()> {
            Ok(())
        }
    }

    fn setup(outage_limit: Duration) -> (TempDir, DeviceManagerConfig, Arc<AsyncCloudConnector>) {
        let dir = TempDir::new().unwrap();
        let conn: Arc<dyn CloudConnector> =
            Arc::new(LocalCloudConnector::new(&dir.path().join("cloud"), "test").unwrap());
        let engine =
            AsyncCloudConnector::start(conn, &dir.path().join("tmp"), 1, 3).unwrap();
        let cfg = DeviceManagerConfig {
            check_period: Duration::from_millis(10),
            outage_limit,
            manage_leds: false,
            diags_dir: dir.path().join("diags"),
            diags_container: "diagnostics".into(),
            device_id: "dev1".into(),
            config_dump: String::new(),
        };
        (dir, cfg, engine)
    }

    #[test]
    fn test_online_updates_ping_stats() {
        let (_dir, cfg, engine) = setup(Duration::from_secs(3600));
        let ping = Arc::new(PingStats::default());
        let mut manager = DeviceManager::spawn(
            cfg,
            Arc::new(SwitchedConnectivity {
                online: Arc::new(AtomicBool::new(true)),
            }),
            Arc::new(RecordingHook::default()),
            Arc::clone(&ping),
            Arc::clone(&engine),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        manager.request_stop();
        manager.join();
        assert_eq!(ping.consecutive_failures(), 0);
        assert_eq!(ping.ip_address(), "10.0.0.2");
        engine.shutdown();
    }

    #[test]
    fn test_prolonged_outage_triggers_diagnostics_and_reboot() {
        let (_dir, cfg, engine) = setup(Duration::ZERO);
        let diags_dir = cfg.diags_dir.clone();
        let ping = Arc::new(PingStats::default());
        let hook = Arc::new(RecordingHook::default());
        let mut manager = DeviceManager::spawn(
            cfg,
            Arc::new(SwitchedConnectivity {
                online: Arc::new(AtomicBool::new(false)),
            }),
            Arc::clone(&hook) as Arc<dyn PlatformHook>,
            Arc::clone(&ping),
            Arc::clone(&engine),
        )
        .unwrap();
        manager.join();
        assert!(hook.rebooted.load(Ordering::SeqCst));
        assert!(ping.consecutive_failures() >= 1);
        // A bundle was captured before the reboot.
        assert_eq!(
            std::fs::read_dir(&diags_dir)
                .unwrap()
                .filter(|e| e
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".txt.gz"))
                .count(),
            1
        );
        engine.shutdown();
    }
}
