//! Edge data-collection runtime: sensor and worker threads supervised by an
//! orchestrator, with journaled and uploaded output flowing through an async
//! cloud engine.

pub mod cloud;
pub mod config;
pub mod context;
pub mod demo;
pub mod diagnostics;
pub mod error;
pub mod factory;
pub mod health;
pub mod journal;
pub mod manager;
pub mod naming;
pub mod node;
pub mod orchestrator;
pub mod processor;
pub mod record;
pub mod sensor;
pub mod signals;
pub mod stats;
pub mod sync;
pub mod tree;
pub mod worker;

pub use config::EdgekitConfig;
pub use context::Context;
pub use error::{EdgekitError, Result};
pub use factory::TreeFactoryRegistry;
pub use orchestrator::{EdgeOrchestrator, OrchState};
pub use sync::StopToken;
