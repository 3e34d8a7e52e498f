//! Data processor seam.
//!
//! A processor consumes the staged output of an upstream node and emits its
//! own records through the same `NodeIo` used by sensors. Processors run on
//! the worker thread of their tree, never on sensor threads.

use crate::error::Result;
use crate::journal::Row;
use crate::node::NodeIo;
use std::path::PathBuf;

/// Input handed to one processor invocation. Tabular streams arrive as rows
/// collected from every staged CSV; everything else arrives as file paths.
#[derive(Debug)]
pub enum ProcessorInput {
    Rows(Vec<Row>),
    Files(Vec<PathBuf>),
}

impl ProcessorInput {
    pub fn len(&self) -> usize {
        match self {
            ProcessorInput::Rows(rows) => rows.len(),
            ProcessorInput::Files(files) => files.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait DataProcessor: Send {
    /// Process one batch of staged input, emitting output through `io`.
    fn process_data(&mut self, input: ProcessorInput, io: &NodeIo) -> Result<()>;
}
