// src/engine/gateway.rs

//! Dispatch gateway: the public entry point for starting, stopping and
//! inspecting runs.
//!
//! Each dispatched device gets its own [`RunRecord`] and its own Tokio task
//! running a [`Coordinator`]. Stopping is two-phase: the gateway marks the
//! run cancelled and raises the device flags, gives scripts `stop_grace` to
//! leave on their own, then terminates whatever process trees remain.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, OrchestrationDefinition};
use crate::config::ExecutionPolicy;
use crate::devices::DeviceRegistry;
use crate::errors::{DroidflowError, Result};
use crate::exec::backend::{DeviceTarget, StepBackend};
use crate::exec::process::TerminateOutcome;
use crate::exec::StepExecutor;
use crate::notify::LogUpdate;
use crate::record::{RunRecord, RunSnapshot};
use crate::registry::flags::CancelFlags;
use crate::registry::RunRegistry;
use crate::store::RunLedger;
use crate::types::{RunId, RunStatus};

use super::coordinator::{close_open_steps, mark_run_stopped, Coordinator};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Why a requested device got no run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    Offline,
    Inactive,
    Unknown,
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterReason::Offline => "离线",
            FilterReason::Inactive => "未启用",
            FilterReason::Unknown => "未知设备",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilteredDevice {
    pub device_id: String,
    pub reason: FilterReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedRun {
    pub run_id: RunId,
    pub device_id: String,
}

/// What a dispatch call started and what it skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub orchestration: String,
    pub runs: Vec<DispatchedRun>,
    pub filtered: Vec<FilteredDevice>,
}

impl Dispatch {
    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.iter().map(|r| r.run_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub run_id: RunId,
    /// An earlier `stop` is already handling this run; nothing was killed.
    pub already_stopping: bool,
    /// Processes registered for the run when the stop began.
    pub processes: usize,
    /// Trees that ignored the interrupt and had to be killed.
    pub forced: usize,
}

/// Shared collaborators the gateway is built from.
pub struct GatewayParts {
    pub catalog: Catalog,
    pub devices: Arc<dyn DeviceRegistry>,
    pub ledger: RunLedger,
    pub registry: RunRegistry,
    pub flags: CancelFlags,
    pub policy: ExecutionPolicy,
}

struct Inner {
    catalog: Catalog,
    devices: Arc<dyn DeviceRegistry>,
    ledger: RunLedger,
    registry: RunRegistry,
    flags: CancelFlags,
    policy: ExecutionPolicy,
    backend: Arc<dyn StepBackend>,
    tasks: Mutex<HashMap<RunId, JoinHandle<RunStatus>>>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("in_flight", &self.in_flight())
            .field("registered", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(parts: GatewayParts, backend: Arc<dyn StepBackend>) -> Self {
        let GatewayParts {
            catalog,
            devices,
            ledger,
            registry,
            flags,
            policy,
        } = parts;
        Self {
            inner: Arc::new(Inner {
                catalog,
                devices,
                ledger,
                registry,
                flags,
                policy,
                backend,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A gateway whose steps run as real processes.
    pub fn with_step_executor(parts: GatewayParts) -> Self {
        let executor = StepExecutor::new(
            parts.ledger.clone(),
            parts.registry.clone(),
            parts.flags.clone(),
            parts.policy.clone(),
        );
        Self::new(parts, Arc::new(executor))
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.inner.ledger
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.inner.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<RunId, JoinHandle<RunStatus>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatchable(&self, orchestration: &str) -> Result<Arc<OrchestrationDefinition>> {
        let def = self
            .inner
            .catalog
            .orchestration(orchestration)
            .ok_or_else(|| DroidflowError::NotFound(format!("orchestration '{orchestration}'")))?;
        if !def.is_active() {
            return Err(DroidflowError::OrchestrationInactive(def.name.clone()));
        }
        if def.steps().is_empty() {
            return Err(DroidflowError::NoStepsConfigured(def.name.clone()));
        }
        Ok(Arc::new(def.clone()))
    }

    fn classify(&self, device_id: &str) -> std::result::Result<DeviceTarget, FilterReason> {
        let devices = &self.inner.devices;
        let Some(connection) = devices.connection_identifier(device_id) else {
            return Err(FilterReason::Unknown);
        };
        if !devices.is_active(device_id) {
            return Err(FilterReason::Inactive);
        }
        if !devices.is_online(device_id) {
            return Err(FilterReason::Offline);
        }
        Ok(DeviceTarget {
            id: device_id.to_string(),
            connection,
        })
    }

    /// Start one run per usable device. Unknown, inactive and offline
    /// devices are reported in [`Dispatch::filtered`]; the call only fails
    /// if none are left.
    pub async fn execute_for_devices(
        &self,
        orchestration: &str,
        device_ids: &[String],
    ) -> Result<Dispatch> {
        let def = self.dispatchable(orchestration)?;

        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        let mut filtered = Vec::new();
        for id in device_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.classify(id) {
                Ok(target) => targets.push(target),
                Err(reason) => {
                    info!(device = %id, %reason, "device filtered from dispatch");
                    filtered.push(FilteredDevice {
                        device_id: id.clone(),
                        reason,
                    });
                }
            }
        }

        if targets.is_empty() {
            return Err(DroidflowError::NoOnlineDevices {
                requested: device_ids.to_vec(),
                filtered: filtered.into_iter().map(|f| f.device_id).collect(),
            });
        }

        let total = u32::try_from(def.steps().len())
            .map_err(|_| DroidflowError::ConfigError(format!("orchestration '{}' has too many steps", def.name)))?;
        let mut runs = Vec::with_capacity(targets.len());
        for target in targets {
            let record = self.inner.ledger.create_run(RunRecord::new(
                def.name.clone(),
                target.id.clone(),
                target.connection.clone(),
                total,
            ))?;
            let run_id = record.id;
            let coordinator = Coordinator::new(
                run_id,
                Arc::clone(&def),
                target.clone(),
                self.inner.ledger.clone(),
                self.inner.registry.clone(),
                Arc::clone(&self.inner.backend),
            );
            let handle = tokio::spawn(coordinator.run());
            self.tasks().insert(run_id, handle);
            info!(run_id, orchestration = %def.name, device = %target.id, "run dispatched");
            runs.push(DispatchedRun {
                run_id,
                device_id: target.id,
            });
        }

        Ok(Dispatch {
            orchestration: def.name.clone(),
            runs,
            filtered,
        })
    }

    /// Entry point for an external schedule checker. Uses `device` if it is
    /// active, otherwise the first active online device.
    pub async fn execute_scheduled(
        &self,
        orchestration: &str,
        device: Option<&str>,
    ) -> Result<DispatchedRun> {
        let devices = &self.inner.devices;
        let chosen = device
            .filter(|id| devices.is_active(id))
            .map(str::to_string)
            .or_else(|| {
                devices
                    .device_ids()
                    .into_iter()
                    .find(|id| devices.is_active(id) && devices.is_online(id))
            });
        let Some(device_id) = chosen else {
            return Err(DroidflowError::NoOnlineDevices {
                requested: device.map(|d| vec![d.to_string()]).unwrap_or_default(),
                filtered: devices.device_ids(),
            });
        };
        debug!(orchestration, device = %device_id, "scheduled dispatch");

        let dispatch = self
            .execute_for_devices(orchestration, std::slice::from_ref(&device_id))
            .await?;
        dispatch.runs.into_iter().next().ok_or_else(|| {
            DroidflowError::NoOnlineDevices {
                requested: vec![device_id],
                filtered: Vec::new(),
            }
        })
    }

    /// Stop a running run.
    ///
    /// Safe to race with the run's own coordinator: whichever side reaches a
    /// terminal write first wins and the other side's write is a no-op.
    pub async fn stop(&self, run_id: RunId) -> Result<StopReport> {
        let run = self.inner.ledger.run(run_id)?;
        if run.is_terminal() {
            return Err(DroidflowError::NotRunning {
                run_id,
                status: run.status,
            });
        }

        let scan = self.inner.registry.cancel_run(run_id);
        if !scan.first {
            debug!(run_id, "stop already in progress");
            return Ok(StopReport {
                run_id,
                already_stopping: true,
                processes: 0,
                forced: 0,
            });
        }
        info!(run_id, processes = scan.processes.len(), "stopping run");

        for process in &scan.processes {
            if let Err(e) = self.inner.flags.raise(&process.device_id) {
                warn!(run_id, device = %process.device_id, error = %e, "could not raise cancel flag");
            }
        }

        let trees: Vec<_> = scan.processes.iter().map(|p| p.tree).collect();
        let deadline = Instant::now() + self.inner.policy.stop_grace;
        while trees.iter().any(|t| t.is_alive()) && Instant::now() < deadline {
            sleep(LIVENESS_POLL).await;
        }

        let grace = self.inner.policy.terminate_grace;
        let mut kills = JoinSet::new();
        for tree in trees {
            kills.spawn(async move { tree.terminate(grace).await });
        }
        let mut forced = 0;
        while let Some(joined) = kills.join_next().await {
            match joined {
                Ok(TerminateOutcome::Forced) => forced += 1,
                Ok(_) => {}
                Err(e) => warn!(run_id, error = %e, "terminate task failed"),
            }
        }

        let (updated, closed) = self.settle_stop(run_id)?;

        info!(
            run_id,
            status = %updated.status,
            forced,
            closed_steps = closed,
            "run stop finished"
        );
        Ok(StopReport {
            run_id,
            already_stopping: false,
            processes: scan.processes.len(),
            forced,
        })
    }

    /// Write the stopped status and close open steps, then drop the run's
    /// cancel mark unless its coordinator is still around to do it.
    fn settle_stop(&self, run_id: RunId) -> Result<(RunRecord, usize)> {
        let mut stopped_here = false;
        let updated = self.inner.ledger.update_run(run_id, |r| {
            stopped_here = mark_run_stopped(r);
        })?;
        let closed = close_open_steps(&self.inner.ledger, run_id)?;

        // A run that reached a terminal status on its own has already
        // finalised; its coordinator will not look at the mark again.
        let coordinator_done = !stopped_here
            || self
                .tasks()
                .get(&run_id)
                .is_none_or(JoinHandle::is_finished);
        if coordinator_done {
            self.inner.registry.release_run(run_id);
        }
        Ok((updated, closed))
    }

    /// Stop every run this gateway still has in flight. Runs that finish
    /// while the stop is underway are skipped.
    pub async fn stop_all(&self) -> Vec<StopReport> {
        let mut reports = Vec::new();
        for run_id in self.in_flight() {
            match self.stop(run_id).await {
                Ok(report) => reports.push(report),
                Err(DroidflowError::NotRunning { .. }) => {}
                Err(e) => warn!(run_id, error = %e, "stop failed"),
            }
        }
        reports
    }

    /// Read-only view of a run and its step records.
    pub fn status(&self, run_id: RunId) -> Result<RunSnapshot> {
        self.inner.ledger.snapshot(run_id)
    }

    /// Receive a [`LogUpdate`] for every buffer change of the run.
    pub fn subscribe(&self, run_id: RunId) -> mpsc::UnboundedReceiver<LogUpdate> {
        self.inner.ledger.hub().subscribe(run_id)
    }

    /// Wait for a run's coordinator to finish and return the stored status.
    pub async fn wait(&self, run_id: RunId) -> Result<RunStatus> {
        let handle = self.tasks().remove(&run_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(run_id, error = %e, "coordinator task did not complete");
            }
        }
        Ok(self.inner.ledger.run(run_id)?.status)
    }

    /// Runs whose coordinator task is still alive, in id order.
    pub fn in_flight(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self
            .tasks()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::StaticDeviceRegistry;
    use crate::fs::mock::MockFileSystem;
    use crate::notify::LogHub;
    use crate::store::MemoryRunStore;

    fn gateway() -> Gateway {
        let policy = ExecutionPolicy::default();
        let flags = CancelFlags::new(
            Arc::new(MockFileSystem::new()),
            "flags",
            policy.cancel_flag_ttl,
        );
        Gateway::with_step_executor(GatewayParts {
            catalog: Catalog::new(),
            devices: Arc::new(StaticDeviceRegistry::new(Vec::new())),
            ledger: RunLedger::new(Arc::new(MemoryRunStore::new()), LogHub::new()),
            registry: RunRegistry::new(),
            flags,
            policy,
        })
    }

    #[tokio::test]
    async fn stop_racing_a_finished_run_drops_the_cancel_mark() {
        let gw = gateway();
        let run_id = gw
            .ledger()
            .create_run(RunRecord::new("o", "d1", "d1", 1))
            .unwrap()
            .id;
        gw.ledger()
            .update_run(run_id, |r| {
                r.finish(RunStatus::Completed, Duration::from_secs(1));
            })
            .unwrap();
        // Coordinator task not yet observed as finished.
        gw.tasks()
            .insert(run_id, tokio::spawn(std::future::pending::<RunStatus>()));
        assert!(gw.registry().cancel_run(run_id).first);

        let (run, closed) = gw.settle_stop(run_id).unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(closed, 0);
        assert!(!gw.registry().is_cancelled(run_id));
        if let Some(handle) = gw.tasks().remove(&run_id) {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn stop_leaves_the_mark_to_a_live_coordinator() {
        let gw = gateway();
        let run_id = gw
            .ledger()
            .create_run(RunRecord::new("o", "d1", "d1", 1))
            .unwrap()
            .id;
        gw.tasks()
            .insert(run_id, tokio::spawn(std::future::pending::<RunStatus>()));
        assert!(gw.registry().cancel_run(run_id).first);

        let (run, _) = gw.settle_stop(run_id).unwrap();

        assert_eq!(run.status, RunStatus::Stopped);
        assert!(gw.registry().is_cancelled(run_id));
        if let Some(handle) = gw.tasks().remove(&run_id) {
            handle.abort();
        }
    }
}
