//! Built-in demo tree: a synthetic sensor producing a file stream and a log
//! stream, plus a processor deriving a dataframe stream from the files. Used
//! by the default device configuration and by the end-to-end tests.

use crate::config::EdgekitConfig;
use crate::error::Result;
use crate::journal::Row;
use crate::naming;
use crate::node::{NodeIo, ProcessorCfg, SensorCfg, Stream};
use crate::processor::{DataProcessor, ProcessorInput};
use crate::record::{self, FileNaming, Format, SensorType, StorageTier};
use crate::sensor::{Sensor, SensorControl};
use crate::tree::{DPtree, NodeRef};
use std::time::Duration;
use tracing::debug;

pub const DEMOF_TYPE_ID: &str = "DEMOF";
pub const DEMOL_TYPE_ID: &str = "DEMOL";
pub const DEMOD_TYPE_ID: &str = "DEMOD";

pub fn demof_stream() -> Stream {
    Stream {
        type_id: DEMOF_TYPE_ID.into(),
        index: 0,
        format: Format::Txt,
        naming: FileNaming::Default,
        tier: StorageTier::Hot,
        cloud_container: None,
        sample_probability: 1.0,
        description: "demo recording files".into(),
    }
}

pub fn demol_stream() -> Stream {
    Stream {
        type_id: DEMOL_TYPE_ID.into(),
        index: 1,
        format: Format::Log,
        naming: FileNaming::Default,
        tier: StorageTier::Hot,
        cloud_container: None,
        sample_probability: 1.0,
        description: "demo log rows".into(),
    }
}

pub fn demod_stream() -> Stream {
    Stream {
        type_id: DEMOD_TYPE_ID.into(),
        index: 0,
        format: Format::Df,
        naming: FileNaming::Default,
        tier: StorageTier::Hot,
        cloud_container: None,
        sample_probability: 1.0,
        description: "rows derived from demo recordings".into(),
    }
}

/// Synthetic sensor: one small recording file and one log row per cycle.
pub struct DemoSensor {
    period: Duration,
    cycle: u64,
}

impl DemoSensor {
    pub fn new(period: Duration) -> Self {
        Self { period, cycle: 0 }
    }
}

impl Sensor for DemoSensor {
    fn run(&mut self, ctl: &SensorControl, io: &NodeIo) -> Result<()> {
        loop {
            if ctl.continue_recording() {
                self.cycle += 1;
                let start = record::utc_now();

                let scratch = naming::temporary_filename(io.staging_dir(), Format::Txt);
                std::fs::write(&scratch, format!("demo recording {}\n", self.cycle))?;
                io.save_recording(&demof_stream(), &scratch, start, None)?;

                let mut row = Row::new();
                row.insert("message".into(), format!("captured cycle {}", self.cycle));
                row.insert("cycle".into(), self.cycle.to_string());
                io.save_data(&demol_stream(), vec![row])?;
                debug!("Demo sensor completed cycle {}", self.cycle);
            }
            if ctl.wait(self.period) {
                return Ok(());
            }
        }
    }
}

/// Derives one dataframe row per consumed recording file.
pub struct DemoProcessor;

impl DataProcessor for DemoProcessor {
    fn process_data(&mut self, input: ProcessorInput, io: &NodeIo) -> Result<()> {
        let files = match input {
            ProcessorInput::Files(files) => files,
            ProcessorInput::Rows(_) => return Ok(()),
        };
        let mut rows = Vec::with_capacity(files.len());
        for file in &files {
            let contents = std::fs::read_to_string(file)?;
            let mut row = Row::new();
            row.insert(
                "source_file".into(),
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
            row.insert("bytes".into(), contents.len().to_string());
            rows.push(row);
        }
        io.save_data(&demod_stream(), rows)
    }
}

/// Build the demo tree with a given sensing period.
pub fn build_demo_tree(sensor_index: u32, period: Duration) -> Result<DPtree> {
    let mut tree = DPtree::new(
        SensorCfg {
            sensor_type: SensorType::Usb,
            type_id: DEMOF_TYPE_ID.into(),
            sensor_index,
            description: "synthetic demo sensor".into(),
            outputs: vec![demof_stream(), demol_stream()],
        },
        Box::new(DemoSensor::new(period)),
    );
    let deriver = tree.add_processor(
        ProcessorCfg {
            processor_id: "demo-deriver".into(),
            description: "derives rows from demo recordings".into(),
            outputs: vec![demod_stream()],
        },
        Box::new(DemoProcessor),
    );
    tree.connect(NodeRef::Sensor, 0, deriver)?;
    Ok(tree)
}

/// Factory entry point registered under the "demo" key.
pub fn build_demo_trees(config: &EdgekitConfig) -> Result<Vec<DPtree>> {
    let period = Duration::from_secs(config.device.env_sensor_frequency_secs);
    Ok(vec![build_demo_tree(0, period)?])
}
