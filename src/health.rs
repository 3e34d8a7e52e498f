//! Host health: disk backpressure for producers, memory pressure for the
//! supervisory loop, and the DeviceHealth system sensor that journals HEART
//! telemetry and captured WARNING rows.

use crate::config::ThresholdsConfig;
use crate::error::Result;
use crate::journal::Row;
use crate::node::NodeIo;
use crate::record;
use crate::sensor::{Sensor, SensorControl};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tracing::{debug, warn};

pub const HEART_BOOT_TIME: &str = "boot_time";
pub const HEART_CPU_PERCENT: &str = "cpu_percent";
pub const HEART_TOTAL_MEMORY_GB: &str = "total_memory_gb";
pub const HEART_MEMORY_PERCENT: &str = "memory_percent";
pub const HEART_DISK_PERCENT: &str = "disk_percent";
pub const HEART_IP_ADDRESS: &str = "ip_address";
pub const HEART_PACKET_LOSS: &str = "packet_loss";
pub const HEART_PING_FAIL_RUN: &str = "current_ping_fail_run";
pub const HEART_PROCESS_COUNT: &str = "process_count";
pub const HEART_CODE_VERSION: &str = "code_version";

pub fn heart_columns() -> Vec<String> {
    vec![
        HEART_BOOT_TIME.to_string(),
        HEART_CPU_PERCENT.to_string(),
        HEART_TOTAL_MEMORY_GB.to_string(),
        HEART_MEMORY_PERCENT.to_string(),
        HEART_DISK_PERCENT.to_string(),
        HEART_IP_ADDRESS.to_string(),
        HEART_PACKET_LOSS.to_string(),
        HEART_PING_FAIL_RUN.to_string(),
        HEART_PROCESS_COUNT.to_string(),
        HEART_CODE_VERSION.to_string(),
    ]
}

/// Connectivity state shared between the device manager (writer) and the
/// DeviceHealth sensor (reader).
#[derive(Debug, Default)]
pub struct PingStats {
    consecutive_failures: AtomicU32,
    packet_loss_percent: Mutex<f32>,
    ip_address: Mutex<String>,
}

impl PingStats {
    pub fn record_success(&self, packet_loss_percent: f32) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.packet_loss_percent.lock() = packet_loss_percent;
    }

    pub fn record_failure(&self) -> u32 {
        *self.packet_loss_percent.lock() = 100.0;
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_ip_address(&self, ip: &str) {
        *self.ip_address.lock() = ip.to_string();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn packet_loss_percent(&self) -> f32 {
        *self.packet_loss_percent.lock()
    }

    pub fn ip_address(&self) -> String {
        let ip = self.ip_address.lock();
        if ip.is_empty() {
            "unknown".to_string()
        } else {
            ip.clone()
        }
    }
}

/// Source of captured warning rows (e.g. a syslog tail). Internals are a
/// platform concern; the runtime only drains whatever the source collected
/// since the last heartbeat.
pub trait LogSource: Send {
    /// Rows in the WARNING schema (`node::warning_columns`).
    fn drain_warnings(&mut self) -> Vec<Row>;
}

/// Default source for platforms with no log capture wired up.
pub struct NullLogSource;

impl LogSource for NullLogSource {
    fn drain_warnings(&mut self) -> Vec<Row> {
        Vec::new()
    }
}

struct DiskCache {
    checked_at: Instant,
    used_percent: f32,
}

/// Answers "can I keep writing?" for producers and samples host telemetry.
///
/// The disk answer is cached because sensor threads ask before every save and
/// a filesystem stat per record would dominate small-record workloads.
pub struct HealthMonitor {
    root: PathBuf,
    thresholds: ThresholdsConfig,
    system: Mutex<System>,
    disk_cache: Mutex<Option<DiskCache>>,
}

impl HealthMonitor {
    pub fn new(root: &Path, thresholds: ThresholdsConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            thresholds,
            system: Mutex::new(System::new_all()),
            disk_cache: Mutex::new(None),
        }
    }

    /// Used-space percentage for the filesystem holding the data root.
    pub fn disk_used_percent(&self) -> f32 {
        let mut cache = self.disk_cache.lock();
        let ttl = Duration::from_secs(self.thresholds.disk_check_cache_secs);
        if let Some(c) = cache.as_ref() {
            if c.checked_at.elapsed() < ttl {
                return c.used_percent;
            }
        }
        let used_percent = match disk_usage(&self.root) {
            Some((used, _)) => used,
            None => {
                debug!("No disk found for {}; assuming no pressure", self.root.display());
                0.0
            }
        };
        *cache = Some(DiskCache {
            checked_at: Instant::now(),
            used_percent,
        });
        used_percent
    }

    /// True when producers should drop new recordings instead of saving them.
    pub fn disk_pressure(&self) -> bool {
        let used = self.disk_used_percent();
        let throttled = used >= self.thresholds.disk_backpressure_percent;
        if throttled {
            warn!(
                "Disk {:.1}% used (threshold {:.1}%); throttling new recordings",
                used, self.thresholds.disk_backpressure_percent
            );
        }
        throttled
    }

    pub fn memory_used_percent(&self) -> f32 {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        (sys.used_memory() as f32 / total as f32) * 100.0
    }

    /// True when the device should reboot to clear a leak or runaway process.
    pub fn memory_pressure_critical(&self) -> bool {
        let used = self.memory_used_percent();
        if used >= self.thresholds.memory_reboot_percent {
            warn!(
                "Memory {:.1}% used (threshold {:.1}%)",
                used, self.thresholds.memory_reboot_percent
            );
            true
        } else {
            false
        }
    }

    /// One HEART telemetry row.
    pub fn heart_row(&self, ping: &PingStats) -> Row {
        let mut sys = self.system.lock();
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_processes();
        let cpu = sys.global_cpu_info().cpu_usage();
        let total = sys.total_memory();
        let mem = if total == 0 {
            0.0
        } else {
            (sys.used_memory() as f32 / total as f32) * 100.0
        };
        let process_count = sys.processes().len();
        drop(sys);

        let disk_percent = disk_usage(&self.root).map(|(used, _)| used).unwrap_or(0.0);

        let mut row = Row::new();
        row.insert(HEART_BOOT_TIME.into(), System::boot_time().to_string());
        row.insert(HEART_CPU_PERCENT.into(), format!("{cpu:.1}"));
        row.insert(
            HEART_TOTAL_MEMORY_GB.into(),
            format!("{:.2}", total as f64 / 1e9),
        );
        row.insert(HEART_MEMORY_PERCENT.into(), format!("{mem:.1}"));
        row.insert(HEART_DISK_PERCENT.into(), format!("{disk_percent:.1}"));
        row.insert(HEART_IP_ADDRESS.into(), ping.ip_address());
        row.insert(
            HEART_PACKET_LOSS.into(),
            format!("{:.1}", ping.packet_loss_percent()),
        );
        row.insert(
            HEART_PING_FAIL_RUN.into(),
            ping.consecutive_failures().to_string(),
        );
        row.insert(HEART_PROCESS_COUNT.into(), process_count.to_string());
        row.insert(
            HEART_CODE_VERSION.into(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        row
    }
}

/// (used %, free bytes) for the disk holding `root`, by longest mount-point
/// prefix match.
fn disk_usage(root: &Path) -> Option<(f32, u64)> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&sysinfo::Disk, usize)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if root.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(_, d)| depth > d).unwrap_or(true) {
                best = Some((disk, depth));
            }
        }
    }
    let (disk, _) = best?;
    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let free = disk.available_space();
    let used_percent = ((total - free) as f32 / total as f32) * 100.0;
    Some((used_percent, free))
}

/// System sensor journaling HEART telemetry and captured warnings on the
/// heartbeat period.
pub struct DeviceHealth {
    monitor: std::sync::Arc<HealthMonitor>,
    ping: std::sync::Arc<PingStats>,
    log_source: Box<dyn LogSource>,
    heart_stream: crate::node::Stream,
    warning_stream: crate::node::Stream,
    period: Duration,
}

impl DeviceHealth {
    pub fn new(
        monitor: std::sync::Arc<HealthMonitor>,
        ping: std::sync::Arc<PingStats>,
        log_source: Box<dyn LogSource>,
        heart_stream: crate::node::Stream,
        warning_stream: crate::node::Stream,
        period: Duration,
    ) -> Self {
        Self {
            monitor,
            ping,
            log_source,
            heart_stream,
            warning_stream,
            period,
        }
    }
}

impl Sensor for DeviceHealth {
    fn run(&mut self, ctl: &SensorControl, io: &NodeIo) -> Result<()> {
        loop {
            let row = self.monitor.heart_row(&self.ping);
            io.save_data(&self.heart_stream, vec![row])?;

            let warnings = self.log_source.drain_warnings();
            if !warnings.is_empty() {
                io.save_data(&self.warning_stream, warnings)?;
            }

            if ctl.wait(self.period) {
                return Ok(());
            }
        }
    }
}
