// src/catalog.rs

//! Orchestration templates and the scripts they reference.
//!
//! A [`Catalog`] is built once from validated configuration and shared
//! read-only with every run; definitions are never mutated mid-run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{DroidflowError, Result};
use crate::types::DefinitionStatus;

/// An external script: interpreter + script file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDefinition {
    pub name: String,
    pub interpreter: PathBuf,
    pub script_path: PathBuf,
    /// Working directory override. Defaults to the script's directory.
    pub working_dir: Option<PathBuf>,
}

impl ScriptDefinition {
    pub fn new(
        name: impl Into<String>,
        interpreter: impl Into<PathBuf>,
        script_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            interpreter: interpreter.into(),
            script_path: script_path.into(),
            working_dir: None,
        }
    }

    /// Whether the script file is present on disk.
    pub fn exists(&self) -> bool {
        self.script_path.is_file()
    }

    /// Fails with [`DroidflowError::Precondition`] when the script file is
    /// missing.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.exists() {
            return Ok(());
        }
        Err(DroidflowError::Precondition(format!(
            "脚本文件不存在：{}",
            self.script_path.display()
        )))
    }

    /// Directory the process is started in.
    pub fn working_dir(&self) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }
        match self.script_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// One step of an orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Position in the strict execution order (>= 1, unique per orchestration).
    pub order: u32,
    pub script: ScriptDefinition,
    pub timeout: Duration,
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationDefinition {
    pub name: String,
    pub status: DefinitionStatus,
    steps: Vec<Step>,
}

impl OrchestrationDefinition {
    /// Build a definition; steps are sorted by execution order.
    ///
    /// Duplicate orders are rejected since they would make the order
    /// ambiguous.
    pub fn new(name: impl Into<String>, status: DefinitionStatus, mut steps: Vec<Step>) -> Result<Self> {
        let name = name.into();
        steps.sort_by_key(|s| s.order);
        for pair in steps.windows(2) {
            if pair[0].order == pair[1].order {
                return Err(DroidflowError::ConfigError(format!(
                    "orchestration '{}' has two steps with execution order {}",
                    name, pair[0].order
                )));
            }
        }
        if let Some(step) = steps.iter().find(|s| s.order == 0) {
            return Err(DroidflowError::ConfigError(format!(
                "orchestration '{}' has a step with execution order {} (must be >= 1)",
                name, step.order
            )));
        }
        Ok(Self {
            name,
            status,
            steps,
        })
    }

    /// Steps in ascending execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }
}

/// All orchestrations and scripts known to this process.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    orchestrations: BTreeMap<String, OrchestrationDefinition>,
    scripts: BTreeMap<String, ScriptDefinition>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_script(&mut self, script: ScriptDefinition) {
        self.scripts.insert(script.name.clone(), script);
    }

    pub fn insert_orchestration(&mut self, def: OrchestrationDefinition) {
        self.orchestrations.insert(def.name.clone(), def);
    }

    pub fn orchestration(&self, name: &str) -> Option<&OrchestrationDefinition> {
        self.orchestrations.get(name)
    }

    pub fn script(&self, name: &str) -> Option<&ScriptDefinition> {
        self.scripts.get(name)
    }

    pub fn orchestrations(&self) -> impl Iterator<Item = &OrchestrationDefinition> {
        self.orchestrations.values()
    }
}

/// Whether `path` looks like a filesystem path rather than a bare program
/// name to be looked up on `PATH`.
pub(crate) fn is_path_like(path: &Path) -> bool {
    path.components().count() > 1 || path.is_absolute()
}
