//! Per-tree worker thread.
//!
//! Each tree with processors gets one worker. On start it publishes the
//! tree's FAIR provenance record, then walks the tree's edges on a fixed
//! cadence: collect staged input for the edge's source stream, hand it to the
//! target processor, and clean up consumed input. A failing edge never stops
//! the others.

use crate::config::DeviceCfg;
use crate::error::Result;
use crate::journal;
use crate::naming;
use crate::node::{NodeIo, Stream};
use crate::processor::ProcessorInput;
use crate::record::{self, SensorType, StorageTier};
use crate::sync::StopToken;
use crate::tree::{DPtree, TreeExport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// FAIR provenance record published once per tree per run: everything needed
/// to interpret the data this tree will produce.
#[derive(Debug, Serialize)]
pub struct FairRecord {
    pub version_id: String,
    pub data_type_id: String,
    pub device_id: String,
    pub sensor_index: u32,
    pub timestamp: String,
    pub code_version: String,
    pub storage_account: String,
    pub device: DeviceCfg,
    pub fleet: BTreeMap<String, String>,
    pub tree: TreeExport,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub tick: Duration,
    /// Files modified more recently than this are assumed still being
    /// written and are left for the next tick.
    pub stale_guard: Duration,
    pub fair_container: String,
}

pub struct DPworker {
    name: String,
    stop: StopToken,
    handle: Option<JoinHandle<()>>,
}

impl DPworker {
    /// Spawn the worker for a tree. The tree is consumed; its sensor should
    /// already have been taken by a `SensorRunner`.
    pub fn spawn(
        mut tree: DPtree,
        io: Arc<NodeIo>,
        cfg: WorkerConfig,
        fair: Option<FairRecord>,
    ) -> std::io::Result<Self> {
        let name = format!(
            "{}-{}",
            tree.sensor_cfg().type_id.to_lowercase(),
            tree.sensor_cfg().sensor_index
        );
        let stop = StopToken::new();
        let thread_stop = stop.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || {
                if tree.processor_count() == 0 {
                    debug!("Worker {thread_name}: no processors, exiting");
                    return;
                }
                info!("Worker {thread_name} started");
                if let Some(fair) = fair {
                    if let Err(e) = publish_fair(&fair, &io, &cfg.fair_container) {
                        warn!("Worker {thread_name}: could not publish FAIR record: {e}");
                    }
                }
                run_loop(&mut tree, &io, &cfg, &thread_stop, &thread_name);
                info!("Worker {thread_name} stopped");
            })?;
        Ok(Self {
            name,
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

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker {} thread panicked", self.name);
            }
        }
    }
}

/// Build the FAIR record for a tree, or None for internal system sensors.
pub fn fair_for_tree(
    tree: &DPtree,
    device: &DeviceCfg,
    fleet: BTreeMap<String, String>,
    storage_account: &str,
) -> Option<FairRecord> {
    let cfg = tree.sensor_cfg();
    if cfg.sensor_type == SensorType::Sys {
        return None;
    }
    Some(FairRecord {
        version_id: record::RECORD_VERSION.to_string(),
        data_type_id: cfg.type_id.clone(),
        device_id: device.device_id.clone(),
        sensor_index: cfg.sensor_index,
        timestamp: record::utc_to_iso_str(record::utc_now()),
        code_version: env!("CARGO_PKG_VERSION").to_string(),
        storage_account: storage_account.to_string(),
        device: device.clone(),
        fleet,
        tree: tree.export(),
    })
}

fn publish_fair(fair: &FairRecord, io: &NodeIo, container: &str) -> Result<()> {
    let yaml = serde_yaml::to_string(fair)?;
    let scratch = naming::temporary_filename(io.staging_dir(), record::Format::Yaml);
    std::fs::write(&scratch, yaml.as_bytes())?;
    let blob = naming::fair_filename(&fair.device_id, &fair.data_type_id, fair.sensor_index);
    io.engine()
        .upload_file(container, &blob, &scratch, StorageTier::Hot)?;
    info!("Published FAIR record {blob}");
    Ok(())
}

fn run_loop(tree: &mut DPtree, io: &Arc<NodeIo>, cfg: &WorkerConfig, stop: &StopToken, name: &str) {
    loop {
        let tick_start = Instant::now();

        let edges: Vec<_> = tree.edges().to_vec();
        for edge in &edges {
            let stream = match tree.edge_source_stream(edge) {
                Ok(s) => s.clone(),
                Err(e) => {
                    error!("Worker {name}: bad edge: {e}");
                    continue;
                }
            };
            if let Err(e) = process_edge(tree, io, cfg, edge, &stream) {
                // Partial-failure isolation: log and move to the next edge.
                warn!("Worker {name}: edge to processor {} failed: {e}", edge.target);
                io.log_warning(&format!(
                    "processing {} stream {} failed: {e}",
                    stream.type_id, stream.index
                ));
            }
            if stop.is_stop_requested() {
                return;
            }
        }

        // Self-correcting cadence: sleep out the remainder of the tick.
        let remaining = cfg.tick.saturating_sub(tick_start.elapsed());
        if stop.wait(remaining) {
            return;
        }
    }
}

fn process_edge(
    tree: &mut DPtree,
    io: &Arc<NodeIo>,
    cfg: &WorkerConfig,
    edge: &crate::tree::Edge,
    stream: &Stream,
) -> Result<()> {
    let files = collect_staged(
        io.staging_dir(),
        stream,
        io.device_id(),
        io.sensor_index(),
        cfg.stale_guard,
    )?;
    if files.is_empty() {
        return Ok(());
    }

    let input = if stream.format.is_tabular() {
        let mut rows = Vec::new();
        for file in &files {
            rows.extend(journal::read_rows_csv(file)?);
        }
        ProcessorInput::Rows(rows)
    } else {
        ProcessorInput::Files(files.clone())
    };
    let count = input.len() as u64;

    let processor_id = tree
        .processor_cfgs()
        .get(edge.target)
        .map(|c| c.processor_id.clone())
        .unwrap_or_else(|| format!("processor-{}", edge.target));

    let started = Instant::now();
    let outcome = tree.run_processor(edge.target, input, io);
    // Processing effort is recorded whether or not the edge succeeded.
    io.stats().record_processor_output(
        &processor_id,
        &stream.type_id,
        io.sensor_index(),
        count,
        started.elapsed().as_secs_f64(),
    );
    outcome?;

    // Input is consumed only on success; a failed edge sees it again next
    // tick.
    for file in &files {
        if let Err(e) = std::fs::remove_file(file) {
            warn!("Could not remove processed input {}: {e}", file.display());
        }
    }
    Ok(())
}

/// Staged files for one stream identity, oldest first, skipping files still
/// being written.
fn collect_staged(
    staging: &Path,
    stream: &Stream,
    device_id: &str,
    sensor_index: u32,
    stale_guard: Duration,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let format = if stream.format.is_tabular() {
            record::Format::Csv
        } else {
            stream.format
        };
        if !naming::matches_stream(
            file_name,
            &stream.type_id,
            device_id,
            sensor_index,
            stream.index,
            format,
        ) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                if modified.elapsed().map(|age| age < stale_guard).unwrap_or(true) {
                    continue;
                }
            }
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::connector::CloudConnector;
    use crate::cloud::{AsyncCloudConnector, JournalPool, LocalCloudConnector};
    use crate::config::ThresholdsConfig;
    use crate::error::EdgekitError;
    use crate::health::HealthMonitor;
    use crate::journal::Row;
    use crate::node::{IoRouting, ProcessorCfg, SensorCfg};
    use crate::processor::DataProcessor;
    use crate::record::{FileNaming, Format};
    use crate::sensor::{Sensor, SensorControl};
    use crate::signals::SignalSet;
    use crate::stats::StatRegistry;
    use crate::tree::NodeRef;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    struct NullSensor;
    impl Sensor for NullSensor {
        fn run(&mut self, _ctl: &SensorControl, _io: &NodeIo) -> Result<()> {
            Ok(())
        }
    }

    struct CountingProcessor {
        seen: Arc<AtomicU64>,
    }
    impl DataProcessor for CountingProcessor {
        fn process_data(&mut self, input: ProcessorInput, _io: &NodeIo) -> Result<()> {
            self.seen.fetch_add(input.len() as u64, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingProcessor;
    impl DataProcessor for FailingProcessor {
        fn process_data(&mut self, _input: ProcessorInput, _io: &NodeIo) -> Result<()> {
            Err(EdgekitError::component(
                "failing".to_string(),
                "simulated".to_string(),
            ))
        }
    }

    struct Fixture {
        _dir: TempDir,
        engine: Arc<AsyncCloudConnector>,
        io: Arc<NodeIo>,
        staging: PathBuf,
        stats: StatRegistry,
    }

    fn fixture(consumed: &[(&str, u32)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let conn: Arc<dyn CloudConnector> =
            Arc::new(LocalCloudConnector::new(&dir.path().join("cloud"), "test").unwrap());
        let engine = AsyncCloudConnector::start(conn, &dir.path().join("tmp"), 1, 3).unwrap();
        let journals = JournalPool::new(Arc::clone(&engine));
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let signals = SignalSet::new(&dir.path().join("flags"));
        let health = Arc::new(HealthMonitor::new(dir.path(), ThresholdsConfig::default()));
        let stats = StatRegistry::new();
        let consumed: HashSet<(String, u32)> = consumed
            .iter()
            .map(|(t, i)| (t.to_string(), *i))
            .collect();
        let io = Arc::new(NodeIo::new(
            "dev1",
            0,
            &staging,
            Arc::clone(&engine),
            journals,
            stats.clone(),
            health,
            signals,
            IoRouting {
                upload_container: "uploads".into(),
                journal_container: "journals".into(),
                system_container: "system".into(),
            },
            consumed,
            60,
            0,
        ));
        Fixture {
            _dir: dir,
            engine,
            io,
            staging,
            stats,
        }
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

    fn tree_with(processor: Box<dyn DataProcessor>) -> DPtree {
        let mut tree = DPtree::new(
            SensorCfg {
                sensor_type: crate::record::SensorType::Usb,
                type_id: "DEMOD".into(),
                sensor_index: 0,
                description: String::new(),
                outputs: vec![df_stream()],
            },
            Box::new(NullSensor),
        );
        let p = tree.add_processor(
            ProcessorCfg {
                processor_id: "counter".into(),
                description: String::new(),
                outputs: vec![],
            },
            processor,
        );
        tree.connect(NodeRef::Sensor, 0, p).unwrap();
        tree
    }

    fn worker_cfg() -> WorkerConfig {
        WorkerConfig {
            tick: Duration::from_millis(20),
            stale_guard: Duration::ZERO,
            fair_container: "fair".into(),
        }
    }

    fn stage_rows(fx: &Fixture, n: usize) {
        let stream = df_stream();
        let rows: Vec<Row> = (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("n".into(), i.to_string());
                row
            })
            .collect();
        fx.io.save_data(&stream, rows).unwrap();
        // Saved via the consumed route, so it must be on disk.
        assert!(std::fs::read_dir(&fx.staging).unwrap().count() > 0);
    }

    #[test]
    fn test_zero_processor_tree_exits_immediately() {
        let fx = fixture(&[]);
        let tree = DPtree::new(
            SensorCfg {
                sensor_type: crate::record::SensorType::Usb,
                type_id: "DEMOD".into(),
                sensor_index: 0,
                description: String::new(),
                outputs: vec![df_stream()],
            },
            Box::new(NullSensor),
        );
        let mut worker =
            DPworker::spawn(tree, Arc::clone(&fx.io), worker_cfg(), None).unwrap();
        worker.join();
        assert!(!worker.is_alive());
        fx.engine.shutdown();
    }

    #[test]
    fn test_staged_rows_are_processed_and_consumed() {
        let fx = fixture(&[("DEMOD", 0)]);
        let seen = Arc::new(AtomicU64::new(0));
        let tree = tree_with(Box::new(CountingProcessor {
            seen: Arc::clone(&seen),
        }));
        stage_rows(&fx, 5);

        let mut worker =
            DPworker::spawn(tree, Arc::clone(&fx.io), worker_cfg(), None).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.request_stop();
        worker.join();

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        // Consumed input is removed from staging.
        assert_eq!(std::fs::read_dir(&fx.staging).unwrap().count(), 0);
        // Processing effort was recorded.
        let (_, scorp) = fx.stats.flush(record::utc_now());
        assert_eq!(scorp.len(), 1);
        assert_eq!(
            scorp[0]
                .get(crate::stats::SCORP_COUNT)
                .map(String::as_str),
            Some("5")
        );
        fx.engine.shutdown();
    }

    #[test]
    fn test_failed_edge_keeps_input_for_retry() {
        let fx = fixture(&[("DEMOD", 0)]);
        let tree = tree_with(Box::new(FailingProcessor));
        stage_rows(&fx, 2);

        let mut worker =
            DPworker::spawn(tree, Arc::clone(&fx.io), worker_cfg(), None).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        worker.request_stop();
        worker.join();

        // Input survives a failing processor so the next run can retry it.
        assert_eq!(std::fs::read_dir(&fx.staging).unwrap().count(), 1);
        fx.engine.shutdown();
    }

    #[test]
    fn test_fair_record_published_once() {
        let fx = fixture(&[("DEMOD", 0)]);
        let tree = tree_with(Box::new(CountingProcessor {
            seen: Arc::new(AtomicU64::new(0)),
        }));
        let device = DeviceCfg::default();
        let fair = fair_for_tree(&tree, &device, BTreeMap::new(), "test-account");
        assert!(fair.is_some());

        let mut worker =
            DPworker::spawn(tree, Arc::clone(&fx.io), worker_cfg(), fair).unwrap();
        assert!(fx.engine.wait_idle(Duration::from_secs(10)));
        worker.request_stop();
        worker.join();

        let blobs = fx.engine.connector().list("fair", "").unwrap();
        assert_eq!(blobs.len(), 1);
        assert!(blobs[0].contains("FAIR-DEMOD"));
        fx.engine.shutdown();
    }

    #[test]
    fn test_sys_sensor_gets_no_fair_record() {
        let mut tree = DPtree::new(
            SensorCfg {
                sensor_type: crate::record::SensorType::Sys,
                type_id: "HEART".into(),
                sensor_index: 0,
                description: String::new(),
                outputs: vec![],
            },
            Box::new(NullSensor),
        );
        let _ = tree.take_sensor();
        assert!(fair_for_tree(&tree, &DeviceCfg::default(), BTreeMap::new(), "acct").is_none());
    }
}
