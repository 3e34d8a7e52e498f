//! The process-wide context object.
//!
//! Everything that would otherwise be a global lives here and is passed
//! explicitly: configuration, the cloud engine, journal pools, the stat
//! registry, signals and the health monitor. Component code receives the
//! pieces it needs, not the whole context.

use crate::cloud::{AsyncCloudConnector, CloudConnector, JournalPool, LocalCloudConnector};
use crate::config::EdgekitConfig;
use crate::error::{EdgekitError, Result};
use crate::health::{HealthMonitor, PingStats};
use crate::node::{IoRouting, NodeIo};
use crate::signals::SignalSet;
use crate::stats::StatRegistry;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct Context {
    pub config: EdgekitConfig,
    pub engine: Arc<AsyncCloudConnector>,
    pub journals: Arc<JournalPool>,
    pub stats: StatRegistry,
    pub signals: SignalSet,
    pub health: Arc<HealthMonitor>,
    pub ping: Arc<PingStats>,
}

impl Context {
    pub fn new(config: EdgekitConfig) -> Result<Arc<Self>> {
        config.validate()?;
        config.paths.create_all()?;

        let connector = build_connector(&config)?;
        let engine = AsyncCloudConnector::start(
            connector,
            &config.paths.tmp_dir(),
            config.thresholds.upload_workers,
            config.thresholds.append_retry_cap,
        )?;
        let journals = JournalPool::new(Arc::clone(&engine));
        let signals = SignalSet::new(&config.paths.flags_dir());
        let health = Arc::new(HealthMonitor::new(
            &config.paths.root(),
            config.thresholds.clone(),
        ));

        info!(
            "Context ready for device {} (root {})",
            config.device.device_id, config.paths.root_dir
        );
        Ok(Arc::new(Self {
            config,
            engine,
            journals,
            stats: StatRegistry::new(),
            signals,
            health,
            ping: Arc::new(PingStats::default()),
        }))
    }

    pub fn routing(&self) -> IoRouting {
        IoRouting {
            upload_container: self.config.device.cc_for_upload.clone(),
            journal_container: self.config.device.cc_for_journals.clone(),
            system_container: self.config.device.cc_for_system_records.clone(),
        }
    }

    /// Build the per-tree output handle.
    pub fn node_io(&self, sensor_index: u32, consumed_streams: HashSet<(String, u32)>) -> NodeIo {
        NodeIo::new(
            &self.config.device.device_id,
            sensor_index,
            &self.config.paths.staging_dir(),
            Arc::clone(&self.engine),
            Arc::clone(&self.journals),
            self.stats.clone(),
            Arc::clone(&self.health),
            self.signals.clone(),
            self.routing(),
            consumed_streams,
            self.config.device.env_sensor_frequency_secs,
            self.config.thresholds.review_cache_secs,
        )
    }

    /// TOML dump of the running configuration, used in diagnostics bundles.
    pub fn config_dump(&self) -> String {
        toml::to_string_pretty(&self.config).unwrap_or_default()
    }

    pub fn staging_dir(&self) -> std::path::PathBuf {
        self.config.paths.staging_dir()
    }
}

fn build_connector(config: &EdgekitConfig) -> Result<Arc<dyn CloudConnector>> {
    match config.cloud.backend.as_str() {
        "local" => Ok(Arc::new(LocalCloudConnector::new(
            Path::new(&config.cloud.local_root),
            &config.cloud.storage_account,
        )?)),
        other => Err(EdgekitError::invalid_config(format!(
            "unknown cloud backend {other:?} (supported: local)"
        ))),
    }
}
