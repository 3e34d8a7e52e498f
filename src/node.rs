//! Stream declarations and `NodeIo`, the single output seam for sensors and
//! processors.
//!
//! Every persisted record passes through `NodeIo`, which stamps the record
//! identity fields and routes the output: streams with a downstream consumer
//! in the same tree are staged locally for the worker thread, everything else
//! goes straight to the cloud (files via the async engine, rows via the
//! journal pool).

use crate::cloud::journal_pool::journal_blob_name;
use crate::cloud::{AsyncCloudConnector, JournalPool};
use crate::error::{EdgekitError, Result};
use crate::health::HealthMonitor;
use crate::journal::Row;
use crate::naming::{self, RecordName};
use crate::record::{self, FileNaming, Format, SensorType, StorageTier};
use crate::signals::SignalSet;
use crate::stats::StatRegistry;
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One output stream of a sensor or processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    /// Data type id, upper-case by convention (e.g. "TRAPCAM").
    pub type_id: String,
    /// Stream index within the owning node's outputs.
    pub index: u32,
    pub format: Format,
    #[serde(default)]
    pub naming: FileNaming,
    #[serde(default)]
    pub tier: StorageTier,
    /// Destination container override; defaults to the device's upload or
    /// journal container depending on format.
    #[serde(default)]
    pub cloud_container: Option<String>,
    /// Fraction of sampling windows this stream records in. 1.0 records
    /// everything; lower values thin uploads via the deterministic gate.
    #[serde(default = "default_sample_probability")]
    pub sample_probability: f64,
    #[serde(default)]
    pub description: String,
}

fn default_sample_probability() -> f64 {
    1.0
}

/// Static description of a sensor node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorCfg {
    pub sensor_type: SensorType,
    pub type_id: String,
    /// Distinguishes multiple sensors of the same type on one device.
    pub sensor_index: u32,
    #[serde(default)]
    pub description: String,
    pub outputs: Vec<Stream>,
}

/// Static description of a processor node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorCfg {
    pub processor_id: String,
    #[serde(default)]
    pub description: String,
    pub outputs: Vec<Stream>,
}

pub const WARNING_TIME_LOGGED: &str = "time_logged";
pub const WARNING_MESSAGE: &str = "message";
pub const WARNING_PROCESS_NAME: &str = "process_name";
pub const WARNING_PRIORITY: &str = "priority";

pub fn warning_columns() -> Vec<String> {
    vec![
        WARNING_TIME_LOGGED.to_string(),
        WARNING_MESSAGE.to_string(),
        WARNING_PROCESS_NAME.to_string(),
        WARNING_PRIORITY.to_string(),
    ]
}

/// Deterministic sampling gate: all sensors of one type on one host agree on
/// which windows are sampled, because the decision is a hash of the type id,
/// the date and the window index rather than a random draw.
pub fn is_sampling_period(
    type_id: &str,
    period_secs: u64,
    sample_probability: f64,
    now: DateTime<Utc>,
) -> bool {
    if sample_probability >= 1.0 {
        return true;
    }
    if sample_probability <= 0.0 || period_secs == 0 {
        return false;
    }
    let window = now.timestamp() as u64 / period_secs;
    let mut hasher = DefaultHasher::new();
    type_id.hash(&mut hasher);
    (now.year(), now.ordinal()).hash(&mut hasher);
    window.hash(&mut hasher);
    let bucket = hasher.finish() % 10_000;
    (bucket as f64) < sample_probability * 10_000.0
}

/// Container routing for one device.
#[derive(Debug, Clone)]
pub struct IoRouting {
    pub upload_container: String,
    pub journal_container: String,
    pub system_container: String,
}

/// Per-tree output handle shared by the tree's sensor and processors.
pub struct NodeIo {
    device_id: String,
    sensor_index: u32,
    staging_dir: PathBuf,
    engine: Arc<AsyncCloudConnector>,
    journals: Arc<JournalPool>,
    stats: StatRegistry,
    health: Arc<HealthMonitor>,
    signals: SignalSet,
    routing: IoRouting,
    /// Streams some processor in the tree consumes; their output is staged
    /// locally instead of uploaded.
    consumed_streams: HashSet<(String, u32)>,
    sample_period: Duration,
    review_cache: Mutex<Option<(Instant, bool)>>,
    review_cache_ttl: Duration,
}

impl NodeIo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: &str,
        sensor_index: u32,
        staging_dir: &Path,
        engine: Arc<AsyncCloudConnector>,
        journals: Arc<JournalPool>,
        stats: StatRegistry,
        health: Arc<HealthMonitor>,
        signals: SignalSet,
        routing: IoRouting,
        consumed_streams: HashSet<(String, u32)>,
        sample_period_secs: u64,
        review_cache_secs: u64,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            sensor_index,
            staging_dir: staging_dir.to_path_buf(),
            engine,
            journals,
            stats,
            health,
            signals,
            routing,
            consumed_streams,
            sample_period: Duration::from_secs(sample_period_secs),
            review_cache: Mutex::new(None),
            review_cache_ttl: Duration::from_secs(review_cache_secs),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn sensor_index(&self) -> u32 {
        self.sensor_index
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn stats(&self) -> &StatRegistry {
        &self.stats
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn engine(&self) -> &Arc<AsyncCloudConnector> {
        &self.engine
    }

    pub fn data_id(&self, stream: &Stream) -> String {
        naming::data_id(
            &stream.type_id,
            &self.device_id,
            self.sensor_index,
            stream.index,
        )
    }

    fn has_consumer(&self, stream: &Stream) -> bool {
        self.consumed_streams
            .contains(&(stream.type_id.clone(), stream.index))
    }

    /// Sampling gate for cloud-bound output. Staged streams are exempt so a
    /// downstream processor always sees its input.
    fn in_sampling_window(&self, stream: &Stream) -> bool {
        is_sampling_period(
            &stream.type_id,
            self.sample_period.as_secs(),
            stream.sample_probability,
            record::utc_now(),
        )
    }

    /// Review-mode check, cached because sensors ask per frame.
    pub fn in_review_mode(&self) -> bool {
        let mut cache = self.review_cache.lock();
        if let Some((at, active)) = *cache {
            if at.elapsed() < self.review_cache_ttl {
                return active;
            }
        }
        let active = self.signals.review_mode_active();
        *cache = Some((Instant::now(), active));
        active
    }

    fn stamp(&self, stream: &Stream, row: &mut Row) {
        row.insert(record::record_id::VERSION.into(), record::RECORD_VERSION.into());
        row.insert(record::record_id::DATA_TYPE_ID.into(), stream.type_id.clone());
        row.insert(record::record_id::DEVICE_ID.into(), self.device_id.clone());
        row.insert(
            record::record_id::SENSOR_INDEX.into(),
            self.sensor_index.to_string(),
        );
        row.insert(
            record::record_id::STREAM_INDEX.into(),
            stream.index.to_string(),
        );
        row.entry(record::record_id::TIMESTAMP.into())
            .or_insert_with(|| record::utc_to_iso_str(record::utc_now()));
    }

    /// Persist tabular rows for a stream. Rows are stamped with the record
    /// identity fields; a missing timestamp gets the current time.
    pub fn save_data(&self, stream: &Stream, mut rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if !stream.format.is_tabular() {
            return Err(EdgekitError::component(
                "node_io".to_string(),
                format!("save_data on non-tabular stream {}", stream.type_id),
            ));
        }
        if !self.has_consumer(stream) && !self.in_sampling_window(stream) {
            debug!(
                "Unsampled window; dropping {} rows of {}",
                rows.len(),
                stream.type_id
            );
            return Ok(());
        }
        for row in &mut rows {
            self.stamp(stream, row);
        }
        let count = rows.len() as u64;

        if self.has_consumer(stream) {
            let file_name = naming::record_filename(
                &stream.type_id,
                &self.device_id,
                self.sensor_index,
                stream.index,
                record::utc_now(),
                None,
                None,
                Format::Csv,
                FileNaming::Default,
            );
            let columns = crate::journal::column_order(&required_columns(), &rows);
            crate::journal::write_rows_csv(&self.staging_dir.join(file_name), &columns, &rows)?;
        } else {
            let container = stream
                .cloud_container
                .as_deref()
                .unwrap_or(&self.routing.journal_container);
            let blob = journal_blob_name(&self.data_id(stream), record::utc_now());
            self.journals
                .add_rows(container, &blob, &required_columns(), rows)?;
        }
        // System streams are not counted, or the stat tracker would generate
        // one SCORE row per flush forever.
        if !record::SYSTEM_TYPE_IDS.contains(&stream.type_id.as_str()) {
            self.stats
                .record_sensor_output(&stream.type_id, self.sensor_index, count);
        }
        Ok(())
    }

    /// Persist a completed recording file. The source file is consumed.
    pub fn save_recording(
        &self,
        stream: &Stream,
        src: &Path,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.save_file(stream, src, start, end, None)
    }

    /// Persist a derived recording (e.g. a clip cut from a parent recording),
    /// keyed by the parent's timestamps plus a distinguishing suffix.
    pub fn save_sub_recording(
        &self,
        stream: &Stream,
        src: &Path,
        parent: &RecordName,
        suffix: &str,
    ) -> Result<()> {
        let start = parent.timestamp.unwrap_or_else(record::utc_now);
        self.save_file(stream, src, start, parent.end_time, Some(suffix))
    }

    fn save_file(
        &self,
        stream: &Stream,
        src: &Path,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        suffix: Option<&str>,
    ) -> Result<()> {
        if !self.has_consumer(stream) && !self.in_sampling_window(stream) {
            std::fs::remove_file(src)?;
            debug!("Unsampled window; dropped {}", src.display());
            return Ok(());
        }
        let naming_mode = if self.in_review_mode() {
            FileNaming::ReviewMode
        } else {
            stream.naming
        };
        let file_name = naming::record_filename(
            &stream.type_id,
            &self.device_id,
            self.sensor_index,
            stream.index,
            start,
            end,
            suffix,
            stream.format,
            naming_mode,
        );

        if self.has_consumer(stream) {
            let dst = self.staging_dir.join(&file_name);
            if std::fs::rename(src, &dst).is_err() {
                std::fs::copy(src, &dst)?;
                std::fs::remove_file(src)?;
            }
            debug!("Staged {} for downstream processing", file_name);
        } else {
            let container = stream
                .cloud_container
                .as_deref()
                .unwrap_or(&self.routing.upload_container)
                .to_string();
            self.engine
                .upload_file(&container, &file_name, src, stream.tier)?;
        }
        self.stats
            .record_sensor_output(&stream.type_id, self.sensor_index, 1);
        Ok(())
    }

    /// Record an operational warning in the device's WARNING journal.
    pub fn log_warning(&self, message: &str) {
        let mut row = Row::new();
        row.insert(
            WARNING_TIME_LOGGED.into(),
            record::utc_to_iso_str(record::utc_now()),
        );
        row.insert(WARNING_MESSAGE.into(), message.to_string());
        row.insert(
            WARNING_PROCESS_NAME.into(),
            std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
        );
        row.insert(WARNING_PRIORITY.into(), "WARNING".into());

        let data_id = naming::data_id(
            record::WARNING_TYPE_ID,
            &self.device_id,
            self.sensor_index,
            0,
        );
        let blob = journal_blob_name(&data_id, record::utc_now());
        if let Err(e) = self.journals.add_rows(
            &self.routing.system_container,
            &blob,
            &warning_columns(),
            vec![row],
        ) {
            tracing::warn!("Could not journal warning: {e}");
        }
    }
}

fn required_columns() -> Vec<String> {
    record::REQD_RECORD_ID_FIELDS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::connector::{CloudConnector, LocalCloudConnector};
    use crate::config::ThresholdsConfig;
    use crate::journal;
    use tempfile::TempDir;

    fn routing() -> IoRouting {
        IoRouting {
            upload_container: "uploads".into(),
            journal_container: "journals".into(),
            system_container: "system".into(),
        }
    }

    struct Fixture {
        _dir: TempDir,
        engine: Arc<AsyncCloudConnector>,
        journals: Arc<JournalPool>,
        staging: PathBuf,
        signals: SignalSet,
        io_parts: (
            StatRegistry,
            Arc<HealthMonitor>,
        ),
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let conn: Arc<dyn CloudConnector> =
            Arc::new(LocalCloudConnector::new(&dir.path().join("cloud"), "test").unwrap());
        let engine =
            AsyncCloudConnector::start(conn, &dir.path().join("tmp"), 2, 3).unwrap();
        let journals = JournalPool::new(Arc::clone(&engine));
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let signals = SignalSet::new(&dir.path().join("flags"));
        let health = Arc::new(HealthMonitor::new(dir.path(), ThresholdsConfig::default()));
        Fixture {
            engine,
            journals,
            staging,
            signals,
            io_parts: (StatRegistry::new(), health),
            _dir: dir,
        }
    }

    fn node_io(fx: &Fixture, consumed: HashSet<(String, u32)>) -> NodeIo {
        NodeIo::new(
            "dev1",
            0,
            &fx.staging,
            Arc::clone(&fx.engine),
            Arc::clone(&fx.journals),
            fx.io_parts.0.clone(),
            Arc::clone(&fx.io_parts.1),
            fx.signals.clone(),
            routing(),
            consumed,
            60,
            0,
        )
    }

    fn df_stream() -> Stream {
        Stream {
            type_id: "DEMOD".into(),
            index: 0,
            format: Format::Df,
            naming: FileNaming::Default,
            tier: StorageTier::Hot,
            cloud_container: None,
            sample_probability: 1.0,
            description: String::new(),
        }
    }

    #[test]
    fn test_save_data_journals_when_unconsumed() {
        let fx = fixture();
        let io = node_io(&fx, HashSet::new());
        let stream = df_stream();
        let mut row = Row::new();
        row.insert("temp".into(), "21.5".into());
        io.save_data(&stream, vec![row]).unwrap();

        assert_eq!(fx.journals.pending_rows(), 1);
        // Nothing staged locally.
        assert_eq!(std::fs::read_dir(&fx.staging).unwrap().count(), 0);
        fx.engine.shutdown();
    }

    #[test]
    fn test_save_data_stages_when_consumed() {
        let fx = fixture();
        let mut consumed = HashSet::new();
        consumed.insert(("DEMOD".to_string(), 0));
        let io = node_io(&fx, consumed);
        let stream = df_stream();
        let mut row = Row::new();
        row.insert("temp".into(), "21.5".into());
        io.save_data(&stream, vec![row]).unwrap();

        let staged: Vec<_> = std::fs::read_dir(&fx.staging).unwrap().collect();
        assert_eq!(staged.len(), 1);
        let rows =
            journal::read_rows_csv(&staged[0].as_ref().unwrap().path()).unwrap();
        // Identity fields are stamped onto every row.
        assert_eq!(
            rows[0].get(record::record_id::DATA_TYPE_ID).map(String::as_str),
            Some("DEMOD")
        );
        assert_eq!(
            rows[0].get(record::record_id::DEVICE_ID).map(String::as_str),
            Some("dev1")
        );
        assert!(rows[0].contains_key(record::record_id::TIMESTAMP));
        assert_eq!(fx.journals.pending_rows(), 0);
        fx.engine.shutdown();
    }

    #[test]
    fn test_save_data_rejects_non_tabular_stream() {
        let fx = fixture();
        let io = node_io(&fx, HashSet::new());
        let mut stream = df_stream();
        stream.format = Format::Jpg;
        assert!(io.save_data(&stream, vec![Row::new()]).is_err());
        fx.engine.shutdown();
    }

    #[test]
    fn test_save_recording_uploads_when_unconsumed() {
        let fx = fixture();
        let io = node_io(&fx, HashSet::new());
        let mut stream = df_stream();
        stream.type_id = "DEMOF".into();
        stream.format = Format::Txt;

        let src = fx.staging.join("scratch.txt");
        std::fs::write(&src, b"recording").unwrap();
        io.save_recording(&stream, &src, record::utc_now(), None)
            .unwrap();
        assert!(!src.exists());
        assert!(fx.engine.wait_idle(Duration::from_secs(10)));
        let blobs = fx.engine.connector().list("uploads", "V3_DEMOF").unwrap();
        assert_eq!(blobs.len(), 1);
        fx.engine.shutdown();
    }

    #[test]
    fn test_review_mode_switches_naming() {
        let fx = fixture();
        let io = node_io(&fx, HashSet::new());
        let mut stream = df_stream();
        stream.type_id = "DEMOF".into();
        stream.format = Format::Txt;
        fx.signals.review_mode.raise().unwrap();

        let src = fx.staging.join("scratch.txt");
        std::fs::write(&src, b"x").unwrap();
        io.save_recording(&stream, &src, record::utc_now(), None)
            .unwrap();
        assert!(fx.engine.wait_idle(Duration::from_secs(10)));
        let blobs = fx.engine.connector().list("uploads", "").unwrap();
        assert!(blobs[0].contains("LATEST"), "got {blobs:?}");
        fx.engine.shutdown();
    }

    #[test]
    fn test_log_warning_lands_in_system_journal() {
        let fx = fixture();
        let io = node_io(&fx, HashSet::new());
        io.log_warning("sensor wobbly");
        assert_eq!(fx.journals.pending_rows(), 1);
        fx.engine.shutdown();
    }

    #[test]
    fn test_sampling_gate_is_deterministic_and_bounded() {
        let now = record::utc_now();
        assert!(is_sampling_period("X", 60, 1.0, now));
        assert!(!is_sampling_period("X", 60, 0.0, now));
        let a = is_sampling_period("DEMOF", 60, 0.5, now);
        let b = is_sampling_period("DEMOF", 60, 0.5, now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unsampled_stream_output_is_dropped() {
        let fx = fixture();
        let io = node_io(&fx, HashSet::new());
        let mut stream = df_stream();
        stream.sample_probability = 0.0;

        let mut row = Row::new();
        row.insert("temp".into(), "21.5".into());
        io.save_data(&stream, vec![row]).unwrap();
        assert_eq!(fx.journals.pending_rows(), 0);

        stream.type_id = "DEMOF".into();
        stream.format = Format::Txt;
        let src = fx.staging.join("scratch.txt");
        std::fs::write(&src, b"x").unwrap();
        io.save_recording(&stream, &src, record::utc_now(), None)
            .unwrap();
        // The source is still consumed, but nothing reaches the cloud.
        assert!(!src.exists());
        assert!(fx.engine.wait_idle(Duration::from_secs(10)));
        assert!(fx.engine.connector().list("uploads", "").unwrap().is_empty());
        fx.engine.shutdown();
    }

    #[test]
    fn test_staged_streams_bypass_sampling_gate() {
        let fx = fixture();
        let mut consumed = HashSet::new();
        consumed.insert(("DEMOD".to_string(), 0));
        let io = node_io(&fx, consumed);
        let mut stream = df_stream();
        stream.sample_probability = 0.0;

        let mut row = Row::new();
        row.insert("temp".into(), "21.5".into());
        io.save_data(&stream, vec![row]).unwrap();
        assert_eq!(std::fs::read_dir(&fx.staging).unwrap().count(), 1);
        fx.engine.shutdown();
    }
}
