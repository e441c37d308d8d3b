use std::path::{Path, PathBuf};
use std::time::Duration;

use droidflow::catalog::{Catalog, OrchestrationDefinition, ScriptDefinition, Step};
use droidflow::config::ExecutionPolicy;
use droidflow::types::DefinitionStatus;

/// Builder for `Step`.
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    pub fn new(order: u32, script: ScriptDefinition) -> Self {
        Self {
            step: Step {
                order,
                script,
                timeout: Duration::from_secs(10),
            },
        }
    }

    /// A step whose script does not need to exist (fake backends never read it).
    pub fn named(order: u32, script: &str) -> Self {
        Self::new(
            order,
            ScriptDefinition::new(script, "/bin/sh", format!("/nonexistent/{script}.sh")),
        )
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.step.timeout = timeout;
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}

/// Builder for `Catalog`.
#[derive(Default)]
pub struct CatalogBuilder {
    catalog: Catalog,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an active orchestration.
    pub fn orchestration(self, name: &str, steps: Vec<Step>) -> Self {
        self.orchestration_with_status(name, DefinitionStatus::Active, steps)
    }

    pub fn orchestration_with_status(
        mut self,
        name: &str,
        status: DefinitionStatus,
        steps: Vec<Step>,
    ) -> Self {
        for step in &steps {
            self.catalog.insert_script(step.script.clone());
        }
        let def = OrchestrationDefinition::new(name, status, steps)
            .expect("Failed to build valid orchestration from builder");
        self.catalog.insert_orchestration(def);
        self
    }

    pub fn build(self) -> Catalog {
        self.catalog
    }
}

/// Builder for `ExecutionPolicy` with short graces suited to tests.
pub struct PolicyBuilder {
    policy: ExecutionPolicy,
}

impl PolicyBuilder {
    pub fn new(flag_dir: impl AsRef<Path>) -> Self {
        Self {
            policy: ExecutionPolicy {
                min_step_timeout: Duration::from_secs(1),
                stop_grace: Duration::from_millis(500),
                terminate_grace: Duration::from_millis(500),
                cancel_flag_ttl: Duration::from_secs(30),
                output_drain_timeout: Duration::from_secs(1),
                fallback_interpreters: Vec::new(),
                flag_dir: flag_dir.as_ref().to_path_buf(),
                store_dir: None,
            },
        }
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.policy.stop_grace = grace;
        self
    }

    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.policy.terminate_grace = grace;
        self
    }

    pub fn fallback_interpreters(mut self, paths: Vec<PathBuf>) -> Self {
        self.policy.fallback_interpreters = paths;
        self
    }

    pub fn store_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.policy.store_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> ExecutionPolicy {
        self.policy
    }
}
