//! Tree factory registry.
//!
//! A device's config names the factory that builds its processing trees.
//! Factories are plain functions registered under a key at startup; there is
//! no dynamic loading, a binary ships the factories it knows about.

use crate::config::EdgekitConfig;
use crate::error::{EdgekitError, Result};
use crate::tree::DPtree;
use std::collections::BTreeMap;
use tracing::info;

pub type TreeFactory = fn(&EdgekitConfig) -> Result<Vec<DPtree>>;

#[derive(Default)]
pub struct TreeFactoryRegistry {
    factories: BTreeMap<String, TreeFactory>,
}

impl TreeFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in factories.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("demo", crate::demo::build_demo_trees);
        registry
    }

    pub fn register(&mut self, key: &str, factory: TreeFactory) {
        self.factories.insert(key.to_string(), factory);
    }

    pub fn keys(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the trees for the factory named in the device config.
    pub fn build(&self, config: &EdgekitConfig) -> Result<Vec<DPtree>> {
        let key = &config.device.tree_factory;
        let factory = self.factories.get(key).ok_or_else(|| {
            EdgekitError::invalid_config(format!(
                "no tree factory registered for {key:?} (known: {:?})",
                self.keys()
            ))
        })?;
        let trees = factory(config)?;
        // An empty tree list is a misconfigured device, not a quiet no-op.
        if trees.is_empty() {
            return Err(EdgekitError::invalid_config(format!(
                "tree factory {key:?} produced no trees"
            )));
        }
        info!("Factory {key:?} built {} trees", trees.len());
        Ok(trees)
    }
}
