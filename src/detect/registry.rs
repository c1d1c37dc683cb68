use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::{DetectorBackend, ModelSpec};

/// Builds a fresh backend instance for one pipeline task.
pub type BackendFactory =
    dyn Fn(&ModelSpec) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static;

/// Registry of named detector backend factories.
///
/// Backends are not shared between tasks: every task asks the registry for its
/// own instance, so a model that fails to load only takes down the task that
/// needed it.
pub struct BackendRegistry {
    factories: HashMap<String, Arc<BackendFactory>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModelSpec) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate a backend by name.
    pub fn create(&self, name: &str, spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        factory(spec)
    }

    /// Instantiate the default backend.
    pub fn create_default(&self, spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.create(name, spec)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
