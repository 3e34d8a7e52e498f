//! Self-telemetry counters.
//!
//! Sensors and processors report how much data they handled; the counters are
//! accumulated here and flushed on the heartbeat period as SCORE rows (sensor
//! output) and SCORP rows (processor output). Flushing resets the counters so
//! each row covers exactly one sample period.

use crate::journal::Row;
use crate::record;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SCORE_OBSERVED_TYPE: &str = "observed_type_id";
pub const SCORE_OBSERVED_INDEX: &str = "observed_sensor_index";
pub const SCORE_SAMPLE_PERIOD: &str = "sample_period";
pub const SCORE_COUNT: &str = "count";

pub const SCORP_PROCESSOR_ID: &str = "data_processor_id";
pub const SCORP_COUNT: &str = "count";
pub const SCORP_DURATION: &str = "duration";

pub fn score_columns() -> Vec<String> {
    vec![
        SCORE_OBSERVED_TYPE.to_string(),
        SCORE_OBSERVED_INDEX.to_string(),
        SCORE_SAMPLE_PERIOD.to_string(),
        SCORE_COUNT.to_string(),
    ]
}

pub fn scorp_columns() -> Vec<String> {
    vec![
        SCORP_PROCESSOR_ID.to_string(),
        SCORE_OBSERVED_TYPE.to_string(),
        SCORE_OBSERVED_INDEX.to_string(),
        SCORP_COUNT.to_string(),
        SCORP_DURATION.to_string(),
    ]
}

#[derive(Debug, Default)]
struct SensorCounter {
    count: u64,
}

#[derive(Debug, Default)]
struct ProcessorCounter {
    count: u64,
    duration_secs: f64,
}

#[derive(Debug, Default)]
struct StatInner {
    sensors: BTreeMap<(String, u32), SensorCounter>,
    processors: BTreeMap<(String, String, u32), ProcessorCounter>,
}

/// Shared registry of per-stream output counters.
#[derive(Debug, Clone, Default)]
pub struct StatRegistry {
    inner: Arc<Mutex<StatInner>>,
}

impl StatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` records emitted by a sensor stream.
    pub fn record_sensor_output(&self, type_id: &str, sensor_index: u32, count: u64) {
        if count == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner
            .sensors
            .entry((type_id.to_string(), sensor_index))
            .or_default()
            .count += count;
    }

    /// Record `count` records emitted by one processor run over a stream.
    pub fn record_processor_output(
        &self,
        processor_id: &str,
        type_id: &str,
        sensor_index: u32,
        count: u64,
        duration_secs: f64,
    ) {
        let mut inner = self.inner.lock();
        let counter = inner
            .processors
            .entry((processor_id.to_string(), type_id.to_string(), sensor_index))
            .or_default();
        counter.count += count;
        counter.duration_secs += duration_secs;
    }

    /// Drain the counters into SCORE and SCORP rows covering the sample
    /// period that ends now.
    pub fn flush(&self, period_start: DateTime<Utc>) -> (Vec<Row>, Vec<Row>) {
        let period_end = record::utc_now();
        let sample_period = (period_end - period_start).num_seconds().max(0);

        let mut inner = self.inner.lock();
        let sensors = std::mem::take(&mut inner.sensors);
        let processors = std::mem::take(&mut inner.processors);
        drop(inner);

        let score_rows = sensors
            .into_iter()
            .map(|((type_id, index), counter)| {
                let mut row = Row::new();
                row.insert(SCORE_OBSERVED_TYPE.into(), type_id);
                row.insert(SCORE_OBSERVED_INDEX.into(), index.to_string());
                row.insert(SCORE_SAMPLE_PERIOD.into(), sample_period.to_string());
                row.insert(SCORE_COUNT.into(), counter.count.to_string());
                row
            })
            .collect();

        let scorp_rows = processors
            .into_iter()
            .map(|((processor_id, type_id, index), counter)| {
                let mut row = Row::new();
                row.insert(SCORP_PROCESSOR_ID.into(), processor_id);
                row.insert(SCORE_OBSERVED_TYPE.into(), type_id);
                row.insert(SCORE_OBSERVED_INDEX.into(), index.to_string());
                row.insert(SCORP_COUNT.into(), counter.count.to_string());
                row.insert(
                    SCORP_DURATION.into(),
                    format!("{:.3}", counter.duration_secs),
                );
                row
            })
            .collect();

        (score_rows, scorp_rows)
    }
}

/// System sensor that drains the registry on the heartbeat period and
/// journals the result as SCORE and SCORP rows.
pub struct StatTracker {
    stats: StatRegistry,
    score_stream: crate::node::Stream,
    scorp_stream: crate::node::Stream,
    period: std::time::Duration,
}

impl StatTracker {
    pub fn new(
        stats: StatRegistry,
        score_stream: crate::node::Stream,
        scorp_stream: crate::node::Stream,
        period: std::time::Duration,
    ) -> Self {
        Self {
            stats,
            score_stream,
            scorp_stream,
            period,
        }
    }
}

impl crate::sensor::Sensor for StatTracker {
    fn run(
        &mut self,
        ctl: &crate::sensor::SensorControl,
        io: &crate::node::NodeIo,
    ) -> crate::error::Result<()> {
        let mut period_start = record::utc_now();
        loop {
            let stopping = ctl.wait(self.period);
            let (score_rows, scorp_rows) = self.stats.flush(period_start);
            period_start = record::utc_now();
            io.save_data(&self.score_stream, score_rows)?;
            io.save_data(&self.scorp_stream, scorp_rows)?;
            if stopping {
                return Ok(());
            }
        }
    }
}
