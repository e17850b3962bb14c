//! In-memory set of loaded workflow definitions
//!
//! Definitions are immutable; reloading swaps in a new `Arc<Workflow>` while
//! runs already being processed keep the one they started with.

use crate::error::{Result, TributaryError};
use crate::models::WorkflowConfig;
use crate::parser::parse_workflow_file;
use crate::units::UnitRegistry;
use crate::workflow::Workflow;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

pub struct WorkflowRegistry {
    units: Arc<UnitRegistry>,
    workflows: RwLock<BTreeMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new(units: Arc<UnitRegistry>) -> Self {
        Self {
            units,
            workflows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.units
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<Workflow>>> {
        self.workflows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<Workflow>>> {
        self.workflows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and load a definition, replacing any previous version
    pub fn load(&self, config: WorkflowConfig) -> Result<Arc<Workflow>> {
        let workflow = Arc::new(Workflow::load(config, &self.units)?);
        let previous = self
            .write()
            .insert(workflow.name().to_string(), Arc::clone(&workflow));

        if previous.is_some() {
            info!("Reloaded workflow '{}'", workflow.name());
        } else {
            info!(
                "Loaded workflow '{}' ({} tasks, schedule {})",
                workflow.name(),
                workflow.task_count(),
                workflow.schedule()
            );
        }
        Ok(workflow)
    }

    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Arc<Workflow>> {
        self.load(parse_workflow_file(path)?)
    }

    /// Load every `*.yaml`/`*.yml` file in a directory.
    ///
    /// Invalid files are reported and skipped; the rest still load.
    ///
    /// # Returns
    ///
    /// The loaded workflows and the per-file errors.
    pub fn load_dir<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<(Vec<Arc<Workflow>>, Vec<(String, TributaryError)>)> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if path.is_file() && is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = Vec::new();
        let mut failed = Vec::new();
        for path in paths {
            match self.load_file(&path) {
                Ok(workflow) => loaded.push(workflow),
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    failed.push((path.display().to_string(), e));
                }
            }
        }
        Ok((loaded, failed))
    }

    pub fn unload(&self, name: &str) -> Option<Arc<Workflow>> {
        self.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        self.read().get(name).cloned()
    }

    /// Loaded workflows, by name
    pub fn list(&self) -> Vec<Arc<Workflow>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
