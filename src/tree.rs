//! Data-processing tree: one sensor root, its processors, and the edges
//! connecting output streams to processor inputs.
//!
//! The tree is static after construction; the worker thread walks the edges
//! in registration order on every tick.

use crate::error::{EdgekitError, Result};
use crate::node::{ProcessorCfg, SensorCfg, Stream};
use crate::processor::DataProcessor;
use crate::sensor::Sensor;
use serde::Serialize;
use std::collections::HashSet;

/// A node in the tree: the sensor root or a processor by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRef {
    Sensor,
    Processor(usize),
}

/// One stream-to-processor connection.
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub source: NodeRef,
    pub stream_index: u32,
    pub target: usize,
}

struct ProcessorNode {
    cfg: ProcessorCfg,
    processor: Box<dyn DataProcessor>,
}

pub struct DPtree {
    sensor_cfg: SensorCfg,
    sensor: Option<Box<dyn Sensor>>,
    processors: Vec<ProcessorNode>,
    edges: Vec<Edge>,
}

/// Serializable snapshot of a tree's configuration, recorded in FAIR records.
#[derive(Debug, Serialize)]
pub struct TreeExport {
    pub sensor: SensorCfg,
    pub processors: Vec<ProcessorCfg>,
    pub edges: Vec<Edge>,
}

impl DPtree {
    pub fn new(sensor_cfg: SensorCfg, sensor: Box<dyn Sensor>) -> Self {
        Self {
            sensor_cfg,
            sensor: Some(sensor),
            processors: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn sensor_cfg(&self) -> &SensorCfg {
        &self.sensor_cfg
    }

    /// Register a processor node, returning its index for `connect`.
    pub fn add_processor(
        &mut self,
        cfg: ProcessorCfg,
        processor: Box<dyn DataProcessor>,
    ) -> usize {
        self.processors.push(ProcessorNode { cfg, processor });
        self.processors.len() - 1
    }

    pub fn processor_cfgs(&self) -> Vec<&ProcessorCfg> {
        self.processors.iter().map(|p| &p.cfg).collect()
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Connect a source node's output stream to a processor's input.
    /// Fails if the stream index does not exist on the source node or the
    /// target processor is unknown.
    pub fn connect(&mut self, source: NodeRef, stream_index: u32, target: usize) -> Result<()> {
        let outputs = self.node_outputs(source)?;
        if !outputs.iter().any(|s| s.index == stream_index) {
            return Err(EdgekitError::invalid_config(format!(
                "node {source:?} has no output stream {stream_index}"
            )));
        }
        if target >= self.processors.len() {
            return Err(EdgekitError::invalid_config(format!(
                "unknown processor index {target}"
            )));
        }
        self.edges.push(Edge {
            source,
            stream_index,
            target,
        });
        Ok(())
    }

    /// Edges in the order they were registered.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    fn node_outputs(&self, node: NodeRef) -> Result<&[Stream]> {
        match node {
            NodeRef::Sensor => Ok(&self.sensor_cfg.outputs),
            NodeRef::Processor(idx) => self
                .processors
                .get(idx)
                .map(|p| p.cfg.outputs.as_slice())
                .ok_or_else(|| {
                    EdgekitError::invalid_config(format!("unknown processor index {idx}"))
                }),
        }
    }

    /// The stream an edge reads from.
    pub fn edge_source_stream(&self, edge: &Edge) -> Result<&Stream> {
        let outputs = self.node_outputs(edge.source)?;
        outputs
            .iter()
            .find(|s| s.index == edge.stream_index)
            .ok_or_else(|| {
                EdgekitError::invalid_config(format!(
                    "edge references missing stream {}",
                    edge.stream_index
                ))
            })
    }

    /// Stream identities consumed by some processor in this tree. `NodeIo`
    /// stages these locally instead of shipping them to the cloud.
    pub fn consumed_streams(&self) -> HashSet<(String, u32)> {
        let mut consumed = HashSet::new();
        for edge in &self.edges {
            if let Ok(stream) = self.edge_source_stream(edge) {
                consumed.insert((stream.type_id.clone(), stream.index));
            }
        }
        consumed
    }

    /// Move the sensor implementation out for its runner thread.
    pub fn take_sensor(&mut self) -> Option<Box<dyn Sensor>> {
        self.sensor.take()
    }

    /// Run one processor by index against an input batch.
    pub fn run_processor(
        &mut self,
        index: usize,
        input: crate::processor::ProcessorInput,
        io: &crate::node::NodeIo,
    ) -> Result<()> {
        let node = self.processors.get_mut(index).ok_or_else(|| {
            EdgekitError::invalid_config(format!("unknown processor index {index}"))
        })?;
        node.processor.process_data(input, io)
    }

    /// Configuration snapshot for provenance records.
    pub fn export(&self) -> TreeExport {
        TreeExport {
            sensor: self.sensor_cfg.clone(),
            processors: self.processors.iter().map(|p| p.cfg.clone()).collect(),
            edges: self.edges.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as EResult;
    use crate::node::NodeIo;
    use crate::processor::ProcessorInput;
    use crate::record::{FileNaming, Format, SensorType, StorageTier};
    use crate::sensor::SensorControl;

    struct NullSensor;
    impl Sensor for NullSensor {
        fn run(&mut self, _ctl: &SensorControl, _io: &NodeIo) -> EResult<()> {
            Ok(())
        }
    }

    struct NullProcessor;
    impl DataProcessor for NullProcessor {
        fn process_data(&mut self, _input: ProcessorInput, _io: &NodeIo) -> EResult<()> {
            Ok(())
        }
    }

    fn stream(type_id: &str, index: u32) -> Stream {
        Stream {
            type_id: type_id.into(),
            index,
            format: Format::Df,
            naming: FileNaming::Default,
            tier: StorageTier::Hot,
            cloud_container: None,
            sample_probability: 1.0,
            description: String::new(),
        }
    }

    fn tree() -> DPtree {
        DPtree::new(
            SensorCfg {
                sensor_type: SensorType::Usb,
                type_id: "DEMOF".into(),
                sensor_index: 0,
                description: String::new(),
                outputs: vec![stream("DEMOF", 0), stream("DEMOL", 1)],
            },
            Box::new(NullSensor),
        )
    }

    #[test]
    fn test_connect_validates_stream_index() {
        let mut t = tree();
        let p = t.add_processor(
            ProcessorCfg {
                processor_id: "p1".into(),
                description: String::new(),
                outputs: vec![stream("DEMOD", 0)],
            },
            Box::new(NullProcessor),
        );
        assert!(t.connect(NodeRef::Sensor, 0, p).is_ok());
        assert!(t.connect(NodeRef::Sensor, 9, p).is_err());
        assert!(t.connect(NodeRef::Sensor, 0, p + 1).is_err());
        assert!(t.connect(NodeRef::Processor(99), 0, p).is_err());
    }

    #[test]
    fn test_edges_keep_registration_order() {
        let mut t = tree();
        let p = t.add_processor(
            ProcessorCfg {
                processor_id: "p1".into(),
                description: String::new(),
                outputs: vec![],
            },
            Box::new(NullProcessor),
        );
        t.connect(NodeRef::Sensor, 1, p).unwrap();
        t.connect(NodeRef::Sensor, 0, p).unwrap();
        let order: Vec<u32> = t.edges().iter().map(|e| e.stream_index).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_consumed_streams() {
        let mut t = tree();
        let p = t.add_processor(
            ProcessorCfg {
                processor_id: "p1".into(),
                description: String::new(),
                outputs: vec![],
            },
            Box::new(NullProcessor),
        );
        t.connect(NodeRef::Sensor, 0, p).unwrap();
        let consumed = t.consumed_streams();
        assert!(consumed.contains(&("DEMOF".to_string(), 0)));
        assert!(!consumed.contains(&("DEMOL".to_string(), 1)));
    }

    #[test]
    fn test_export_is_yaml_serializable() {
        let mut t = tree();
        let p = t.add_processor(
            ProcessorCfg {
                processor_id: "p1".into(),
                description: String::new(),
                outputs: vec![stream("DEMOD", 0)],
            },
            Box::new(NullProcessor),
        );
        t.connect(NodeRef::Sensor, 0, p).unwrap();
        let yaml = serde_yaml::to_string(&t.export()).unwrap();
        assert!(yaml.contains("DEMOF"));
        assert!(yaml.contains("p1"));
    }

    #[test]
    fn test_take_sensor_is_one_shot() {
        let mut t = tree();
        assert!(t.take_sensor().is_some());
        assert!(t.take_sensor().is_none());
    }
}
