// src/registry/mod.rs

//! Shared map of in-flight step processes.
//!
//! The registry is the only structure mutated by more than one concurrency
//! unit: step executors register and unregister their processes, the stop
//! path scans a run's entries and fires their cancellation tokens. Every
//! operation takes the single internal lock, so a scan never observes a
//! half-applied register/unregister.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{DroidflowError, Result};
use crate::exec::process::ProcessTree;
use crate::types::RunId;

pub mod flags;

/// Composite key: one entry per (run, step) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunKey {
    pub run_id: RunId,
    pub step_order: u32,
}

impl RunKey {
    pub fn new(run_id: RunId, step_order: u32) -> Self {
        Self { run_id, step_order }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.run_id, self.step_order)
    }
}

/// A live step process as seen by the cancellation path.
#[derive(Debug, Clone)]
pub struct RegisteredProcess {
    pub key: RunKey,
    pub tree: ProcessTree,
    pub device_id: String,
    /// Fired by [`RunRegistry::cancel_run`]; the owning executor is waiting on it.
    pub cancel: CancellationToken,
}

impl RegisteredProcess {
    pub fn run_id(&self) -> RunId {
        self.key.run_id
    }

    pub fn pid(&self) -> u32 {
        self.tree.pid()
    }
}

/// Result of [`RunRegistry::cancel_run`].
#[derive(Debug, Clone)]
pub struct CancelScan {
    /// `false` if the run was already marked cancelled by an earlier call.
    pub first: bool,
    /// Processes registered for the run at the moment of the scan.
    pub processes: Vec<RegisteredProcess>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: BTreeMap<RunKey, RegisteredProcess>,
    cancelled: HashSet<RunId>,
}

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave the maps half-updated
        // (every mutation is a single insert/remove), so poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a process. Fails if the key is taken or if its run is being
    /// cancelled; the caller owns the process in both failure cases.
    pub fn register(&self, process: RegisteredProcess) -> Result<()> {
        let mut state = self.lock();
        let key = process.key;
        if state.cancelled.contains(&key.run_id) {
            return Err(DroidflowError::Cancelled(key.run_id));
        }
        if state.entries.contains_key(&key) {
            return Err(DroidflowError::DuplicateKey(key));
        }
        debug!(key = %key, pid = process.pid(), device = %process.device_id, "registered process");
        state.entries.insert(key, process);
        Ok(())
    }

    pub fn lookup(&self, key: &RunKey) -> Result<RegisteredProcess> {
        self.lock()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| DroidflowError::NotFound(format!("process for run key {key}")))
    }

    /// Remove an entry. Absent keys are ignored.
    pub fn unregister(&self, key: &RunKey) -> Option<RegisteredProcess> {
        let removed = self.lock().entries.remove(key);
        if removed.is_some() {
            debug!(key = %key, "unregistered process");
        }
        removed
    }

    /// Every registered process belonging to `run_id`, in step order.
    pub fn list_by_run(&self, run_id: RunId) -> Vec<RegisteredProcess> {
        let state = self.lock();
        Self::scan(&state, run_id)
    }

    fn scan(state: &RegistryState, run_id: RunId) -> Vec<RegisteredProcess> {
        state
            .entries
            .range(RunKey::new(run_id, 0)..=RunKey::new(run_id, u32::MAX))
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Mark `run_id` cancelled and fire the token of every process it has
    /// registered, all under one lock acquisition.
    ///
    /// After this call no new process can register for the run until
    /// [`RunRegistry::release_run`].
    pub fn cancel_run(&self, run_id: RunId) -> CancelScan {
        let mut state = self.lock();
        let first = state.cancelled.insert(run_id);
        let processes = Self::scan(&state, run_id);
        if first {
            for process in &processes {
                process.cancel.cancel();
            }
            info!(run_id, processes = processes.len(), "run cancellation requested");
        }
        CancelScan { first, processes }
    }

    pub fn is_cancelled(&self, run_id: RunId) -> bool {
        self.lock().cancelled.contains(&run_id)
    }

    /// Forget the cancellation mark once the run's coordinator has finished.
    pub fn release_run(&self, run_id: RunId) {
        self.lock().cancelled.remove(&run_id);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
