use crate::error::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EdgekitConfig {
    pub device: DeviceCfg,
    pub paths: PathsConfig,
    pub cloud: CloudConfig,
    pub timing: TimingConfig,
    pub thresholds: ThresholdsConfig,
    /// Full fleet roster (id -> name) recorded in FAIR records so a dashboard
    /// can cross-check fleet presence.
    #[serde(default)]
    pub fleet: Vec<FleetDevice>,
}

/// Identity and policy for this physical device.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceCfg {
    /// Device identity, commonly the MAC address.
    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_device_name")]
    pub name: String,

    #[serde(default)]
    pub notes: String,

    /// Key into the tree-factory registry that builds this device's DPtrees.
    #[serde(default = "default_tree_factory")]
    pub tree_factory: String,

    /// Arbitrary key-value pairs recorded in the FAIR record.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Cloud container for uploaded recording files
    #[serde(default = "default_cc_upload")]
    pub cc_for_upload: String,

    /// Cloud container for raw CSV journals
    #[serde(default = "default_cc_journals")]
    pub cc_for_journals: String,

    /// Cloud container for system records (HEART, WARNING, SCORE, SCORP)
    #[serde(default = "default_cc_system_records")]
    pub cc_for_system_records: String,

    /// Cloud container for FAIR provenance records
    #[serde(default = "default_cc_fair")]
    pub cc_for_fair: String,

    /// Cloud container for system test results
    #[serde(default = "default_cc_system_test")]
    pub cc_for_system_test: String,

    /// Cloud container for diagnostics bundles
    #[serde(default = "default_cc_diagnostics")]
    pub cc_for_diagnostics: String,

    /// Heartbeat / self-telemetry period in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heart_beat_frequency_secs: u64,

    /// Environmental sensor poll period in seconds
    #[serde(default = "default_env_sensor_secs")]
    pub env_sensor_frequency_secs: u64,

    /// Review-mode output period in seconds
    #[serde(default = "default_review_frequency_secs")]
    pub review_mode_frequency_secs: u64,

    /// Upper bound on a single recording; also bounds clean-shutdown waits
    #[serde(default = "default_max_recording_secs")]
    pub max_recording_timer_secs: u64,

    #[serde(default = "default_true")]
    pub attempt_wifi_recovery: bool,

    #[serde(default = "default_true")]
    pub manage_leds: bool,

    /// Wi-Fi networks the device may join, in priority order
    #[serde(default)]
    pub wifi_clients: Vec<WifiClient>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WifiClient {
    pub ssid: String,
    pub priority: u32,
    pub pw: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FleetDevice {
    pub device_id: String,
    pub name: String,
    #[serde(default = "default_tree_factory")]
    pub tree_factory: String,
}

/// Local filesystem layout. Everything lives under `root_dir`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

impl PathsConfig {
    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.root_dir)
    }

    /// Staging directory sensors write into and workers poll.
    pub fn staging_dir(&self) -> PathBuf {
        self.root().join("staging")
    }

    /// Scratch space for journal materialization and deferred uploads.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root().join("tmp")
    }

    pub fn flags_dir(&self) -> PathBuf {
        self.root().join("flags")
    }

    pub fn diags_dir(&self) -> PathBuf {
        self.root().join("diagnostics")
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [
            self.staging_dir(),
            self.tmp_dir(),
            self.flags_dir(),
            self.diags_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CloudConfig {
    /// Connector backend selected at startup. "local" is filesystem-backed.
    #[serde(default = "default_cloud_backend")]
    pub backend: String,

    /// Root directory for the local backend's blob tree
    #[serde(default = "default_cloud_root")]
    pub local_root: String,

    /// Storage account identity recorded in FAIR records
    #[serde(default = "default_storage_account")]
    pub storage_account: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimingConfig {
    /// Supervisory loop tick; the liveness marker is touched at this period
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_frequency_secs: u64,

    /// DPworker processing loop period
    #[serde(default = "default_worker_tick_secs")]
    pub worker_tick_secs: u64,

    /// Journal pool cloud-sync period
    #[serde(default = "default_journal_sync_secs")]
    pub journal_sync_secs: u64,

    /// Device manager connectivity-check period
    #[serde(default = "default_connectivity_check_secs")]
    pub connectivity_check_secs: u64,
}

/// Empirically tuned limits. These are defaults, not invariants; every one can
/// be overridden per device.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ThresholdsConfig {
    /// Disk usage percentage above which producers self-throttle
    #[serde(default = "default_disk_backpressure")]
    pub disk_backpressure_percent: f32,

    /// How long the disk-pressure answer is cached, in seconds
    #[serde(default = "default_disk_check_cache_secs")]
    pub disk_check_cache_secs: u64,

    /// Memory usage percentage that triggers a diagnostics-preceded reboot
    #[serde(default = "default_memory_reboot")]
    pub memory_reboot_percent: f32,

    /// Hours of failed connectivity before a diagnostics-preceded reboot
    #[serde(default = "default_connectivity_reboot_hours")]
    pub connectivity_reboot_hours: u64,

    /// Worker threads in the async upload pool
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    /// Retry iterations before a failed append is dropped
    #[serde(default = "default_append_retry_cap")]
    pub append_retry_cap: u32,

    /// Consecutive sensor failures before escalating to a fleet restart
    #[serde(default = "default_sensor_max_failures")]
    pub sensor_max_consecutive_failures: u32,

    /// Backoff between sensor failure retries, in seconds
    #[serde(default = "default_sensor_failure_backoff_secs")]
    pub sensor_failure_backoff_secs: u64,

    /// Ignore staged files modified within this many seconds (still being written)
    #[serde(default = "default_stale_file_guard_secs")]
    pub stale_file_guard_secs: u64,

    /// How long the review-mode answer is cached, in seconds
    #[serde(default = "default_review_cache_secs")]
    pub review_cache_secs: u64,
}

impl EdgekitConfig {
    /// Load configuration from the default file locations and environment.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from_file("edgekit.toml")
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("EDGEKIT").separator("__"))
            .build()?;

        let cfg: EdgekitConfig = config.try_deserialize()?;
        info!(
            "Configuration loaded for device {} ({})",
            cfg.device.device_id, cfg.device.name
        );
        Ok(cfg)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.device.device_id.is_empty() {
            return Err(ConfigError::Message("device.device_id must be set".into()));
        }
        if self.device.tree_factory.is_empty() {
            return Err(ConfigError::Message(
                "device.tree_factory must name a registered factory".into(),
            ));
        }
        for container in [
            &self.device.cc_for_upload,
            &self.device.cc_for_journals,
            &self.device.cc_for_system_records,
            &self.device.cc_for_fair,
            &self.device.cc_for_system_test,
            &self.device.cc_for_diagnostics,
        ] {
            if container.is_empty() {
                return Err(ConfigError::Message(
                    "cloud container names must not be empty".into(),
                ));
            }
        }
        if !(0.0..=100.0).contains(&self.thresholds.disk_backpressure_percent) {
            return Err(ConfigError::Message(
                "thresholds.disk_backpressure_percent must be 0-100".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.thresholds.memory_reboot_percent) {
            return Err(ConfigError::Message(
                "thresholds.memory_reboot_percent must be 0-100".into(),
            ));
        }
        if self.thresholds.upload_workers == 0 {
            return Err(ConfigError::Message(
                "thresholds.upload_workers must be at least 1".into(),
            ));
        }
        if self.timing.watchdog_frequency_secs == 0 || self.timing.worker_tick_secs == 0 {
            return Err(ConfigError::Message(
                "timing periods must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The fleet roster as an id -> name map for FAIR records.
    pub fn fleet_map(&self) -> BTreeMap<String, String> {
        self.fleet
            .iter()
            .map(|d| (d.device_id.clone(), d.name.clone()))
            .collect()
    }
}

impl Default for EdgekitConfig {
    fn default() -> Self {
        Self {
            device: DeviceCfg::default(),
            paths: PathsConfig {
                root_dir: default_root_dir(),
            },
            cloud: CloudConfig {
                backend: default_cloud_backend(),
                local_root: default_cloud_root(),
                storage_account: default_storage_account(),
            },
            timing: TimingConfig::default(),
            thresholds: ThresholdsConfig::default(),
            fleet: Vec::new(),
        }
    }
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            name: default_device_name(),
            notes: String::new(),
            tree_factory: default_tree_factory(),
            tags: BTreeMap::new(),
            cc_for_upload: default_cc_upload(),
            cc_for_journals: default_cc_journals(),
            cc_for_system_records: default_cc_system_records(),
            cc_for_fair: default_cc_fair(),
            cc_for_system_test: default_cc_system_test(),
            cc_for_diagnostics: default_cc_diagnostics(),
            heart_beat_frequency_secs: default_heartbeat_secs(),
            env_sensor_frequency_secs: default_env_sensor_secs(),
            review_mode_frequency_secs: default_review_frequency_secs(),
            max_recording_timer_secs: default_max_recording_secs(),
            attempt_wifi_recovery: true,
            manage_leds: true,
            wifi_clients: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            watchdog_frequency_secs: default_watchdog_secs(),
            worker_tick_secs: default_worker_tick_secs(),
            journal_sync_secs: default_journal_sync_secs(),
            connectivity_check_secs: default_connectivity_check_secs(),
        }
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            disk_backpressure_percent: default_disk_backpressure(),
            disk_check_cache_secs: default_disk_check_cache_secs(),
            memory_reboot_percent: default_memory_reboot(),
            connectivity_reboot_hours: default_connectivity_reboot_hours(),
            upload_workers: default_upload_workers(),
            append_retry_cap: default_append_retry_cap(),
            sensor_max_consecutive_failures: default_sensor_max_failures(),
            sensor_failure_backoff_secs: default_sensor_failure_backoff_secs(),
            stale_file_guard_secs: default_stale_file_guard_secs(),
            review_cache_secs: default_review_cache_secs(),
        }
    }
}

fn default_device_id() -> String {
    "unknown".to_string()
}
fn default_device_name() -> String {
    "default".to_string()
}
fn default_tree_factory() -> String {
    "demo".to_string()
}
fn default_cc_upload() -> String {
    "edgekit-upload".to_string()
}
fn default_cc_journals() -> String {
    "edgekit-journals".to_string()
}
fn default_cc_system_records() -> String {
    "edgekit-system-records".to_string()
}
fn default_cc_fair() -> String {
    "edgekit-fair".to_string()
}
fn default_cc_system_test() -> String {
    "edgekit-system-test".to_string()
}
fn default_cc_diagnostics() -> String {
    "edgekit-diagnostics".to_string()
}
fn default_heartbeat_secs() -> u64 {
    600
}
fn default_env_sensor_secs() -> u64 {
    600
}
fn default_review_frequency_secs() -> u64 {
    10
}
fn default_max_recording_secs() -> u64 {
    180
}
fn default_true() -> bool {
    true
}
fn default_root_dir() -> String {
    "/edgekit".to_string()
}
fn default_cloud_backend() -> String {
    "local".to_string()
}
fn default_cloud_root() -> String {
    "/edgekit/local_cloud".to_string()
}
fn default_storage_account() -> String {
    "local".to_string()
}
fn default_watchdog_secs() -> u64 {
    60
}
fn default_worker_tick_secs() -> u64 {
    60
}
fn default_journal_sync_secs() -> u64 {
    60
}
fn default_connectivity_check_secs() -> u64 {
    60
}
fn default_disk_backpressure() -> f32 {
    75.0
}
fn default_disk_check_cache_secs() -> u64 {
    30
}
fn default_memory_reboot() -> f32 {
    90.0
}
fn default_connectivity_reboot_hours() -> u64 {
    4
}
fn default_upload_workers() -> usize {
    6
}
fn default_append_retry_cap() -> u32 {
    100
}
fn default_sensor_max_failures() -> u32 {
    30
}
fn default_sensor_failure_backoff_secs() -> u64 {
    60
}
fn default_stale_file_guard_secs() -> u64 {
    5
}
fn default_review_cache_secs() -> u64 {
    5
}
