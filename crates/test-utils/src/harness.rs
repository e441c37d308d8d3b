use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use droidflow::catalog::{Catalog, ScriptDefinition};
use droidflow::config::ExecutionPolicy;
use droidflow::devices::{DeviceEntry, StaticDeviceRegistry};
use droidflow::engine::{Gateway, GatewayParts};
use droidflow::exec::{StepBackend, StepExecutor};
use droidflow::fs::{FileSystem, RealFileSystem};
use droidflow::notify::LogHub;
use droidflow::registry::flags::CancelFlags;
use droidflow::registry::RunRegistry;
use droidflow::store::{MemoryRunStore, RunLedger, RunStore};
use tempfile::TempDir;

use crate::builders::PolicyBuilder;

/// Everything a test needs to run steps for real: a scratch directory for
/// scripts and cancel flags, an in-memory ledger, a registry and a policy
/// with short graces.
pub struct Harness {
    pub dir: TempDir,
    pub ledger: RunLedger,
    pub registry: RunRegistry,
    pub flags: CancelFlags,
    pub policy: ExecutionPolicy,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let policy = PolicyBuilder::new(dir.path().join("flags")).build();
        Self::with_policy(dir, policy)
    }

    pub fn with_policy(dir: TempDir, policy: ExecutionPolicy) -> Self {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
        let flags = CancelFlags::new(fs, policy.flag_dir.clone(), policy.cancel_flag_ttl);
        Self {
            dir,
            ledger: RunLedger::new(store, LogHub::new()),
            registry: RunRegistry::new(),
            flags,
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `body` as a `/bin/sh` script under `scripts/`.
    pub fn script(&self, name: &str, body: &str) -> ScriptDefinition {
        let scripts = self.dir.path().join("scripts");
        fs::create_dir_all(&scripts).expect("create scripts dir");
        let path: PathBuf = scripts.join(format!("{name}.sh"));
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        ScriptDefinition::new(name, "/bin/sh", path)
    }

    pub fn executor(&self) -> StepExecutor {
        StepExecutor::new(
            self.ledger.clone(),
            self.registry.clone(),
            self.flags.clone(),
            self.policy.clone(),
        )
    }

    fn parts(&self, catalog: Catalog, devices: Vec<DeviceEntry>) -> GatewayParts {
        GatewayParts {
            catalog,
            devices: Arc::new(StaticDeviceRegistry::new(devices)),
            ledger: self.ledger.clone(),
            registry: self.registry.clone(),
            flags: self.flags.clone(),
            policy: self.policy.clone(),
        }
    }

    /// Gateway running real processes.
    pub fn gateway(&self, catalog: Catalog, devices: Vec<DeviceEntry>) -> Gateway {
        Gateway::with_step_executor(self.parts(catalog, devices))
    }

    /// Gateway driving a custom backend.
    pub fn gateway_with(
        &self,
        catalog: Catalog,
        devices: Vec<DeviceEntry>,
        backend: Arc<dyn StepBackend>,
    ) -> Gateway {
        Gateway::new(self.parts(catalog, devices), backend)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
