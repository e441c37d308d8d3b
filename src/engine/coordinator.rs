// src/engine/coordinator.rs

//! Orchestration coordinator: one task per (orchestration, device) run.
//!
//! Steps run strictly in order through the [`StepBackend`]. Before each
//! step the coordinator checks for a stop, bumps the progress counter and
//! persists; after each step it appends the step's sections to the run's
//! combined buffers. Whatever happens, the run ends in a terminal status:
//! normally via [`Coordinator::run`]'s finalisation, otherwise via
//! [`FinalizeGuard`] when the task is dropped or panics.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::OrchestrationDefinition;
use crate::errors::Result;
use crate::exec::backend::{DeviceTarget, StepBackend, StepRequest};
use crate::exec::step_runner::STOPPED_NOTE;
use crate::record::RunRecord;
use crate::registry::RunRegistry;
use crate::store::RunLedger;
use crate::types::{RunId, RunStatus, StepStatus};

use super::progress::{conclude, NextStep, RunProgress};

pub(crate) const ABANDONED_NOTE: &str = "编排协调任务异常退出";

/// Stderr note appended when a run is stopped by hand.
pub(crate) fn stop_note() -> String {
    format!(
        "\n任务已手动停止 - 时间：{}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// Close a run as stopped. Returns whether this call made the transition.
pub(crate) fn mark_run_stopped(run: &mut RunRecord) -> bool {
    let elapsed = (Utc::now() - run.started_at).to_std().unwrap_or_default();
    if !run.finish(RunStatus::Stopped, elapsed) {
        return false;
    }
    run.stderr.push_str(&stop_note());
    run.error_msg.get_or_insert_with(|| STOPPED_NOTE.to_string());
    true
}

/// Close every non-terminal step record of a run as stopped.
pub(crate) fn close_open_steps(ledger: &RunLedger, run_id: RunId) -> Result<usize> {
    let mut closed = 0;
    for step in ledger.steps_of(run_id)? {
        if step.is_terminal() {
            continue;
        }
        let updated = ledger.update_step(step.id, |s| {
            let elapsed = (Utc::now() - s.started_at).to_std().unwrap_or_default();
            if s.finish(StepStatus::Stopped, elapsed) {
                s.error_msg = Some(STOPPED_NOTE.to_string());
            }
        })?;
        if updated.status == StepStatus::Stopped {
            closed += 1;
        }
    }
    Ok(closed)
}

/// Marks the run failed if the coordinator never reached finalisation.
struct FinalizeGuard {
    ledger: RunLedger,
    registry: RunRegistry,
    run_id: RunId,
    started: Instant,
    armed: bool,
}

impl FinalizeGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let elapsed = self.started.elapsed();
        warn!(run_id = self.run_id, "coordinator exited without finalising; marking run failed");
        let result = self.ledger.update_run(self.run_id, |r| {
            if r.finish(RunStatus::Failed, elapsed) {
                r.error_msg = Some(ABANDONED_NOTE.to_string());
                r.stderr
                    .push_str(&format!("\n编排任务全局错误：{ABANDONED_NOTE}\n"));
            } else {
                r.settle_duration(elapsed);
            }
        });
        if let Err(e) = result {
            error!(run_id = self.run_id, error = %e, "could not persist abandoned run");
        }
        self.registry.release_run(self.run_id);
    }
}

pub struct Coordinator {
    run_id: RunId,
    orchestration: Arc<OrchestrationDefinition>,
    device: DeviceTarget,
    ledger: RunLedger,
    registry: RunRegistry,
    backend: Arc<dyn StepBackend>,
}

impl Coordinator {
    pub fn new(
        run_id: RunId,
        orchestration: Arc<OrchestrationDefinition>,
        device: DeviceTarget,
        ledger: RunLedger,
        registry: RunRegistry,
        backend: Arc<dyn StepBackend>,
    ) -> Self {
        Self {
            run_id,
            orchestration,
            device,
            ledger,
            registry,
            backend,
        }
    }

    /// Drive the run to a terminal status and return it.
    pub async fn run(self) -> RunStatus {
        let started = Instant::now();
        let mut guard = FinalizeGuard {
            ledger: self.ledger.clone(),
            registry: self.registry.clone(),
            run_id: self.run_id,
            started,
            armed: true,
        };

        info!(
            run_id = self.run_id,
            orchestration = %self.orchestration.name,
            device = %self.device.id,
            steps = self.orchestration.steps().len(),
            "run started"
        );

        let mut progress = RunProgress::new(self.orchestration.steps().len());
        let outcome = self.drive(&mut progress).await;
        if let Err(e) = &outcome {
            error!(run_id = self.run_id, error = %e, "run aborted by bookkeeping failure");
        }

        match self.finalize(&progress, outcome, started.elapsed()) {
            Ok(status) => {
                guard.disarm();
                status
            }
            Err(e) => {
                error!(run_id = self.run_id, error = %e, "failed to finalise run");
                RunStatus::Failed
            }
        }
    }

    fn stop_requested(&self) -> Result<bool> {
        if self.registry.is_cancelled(self.run_id) {
            return Ok(true);
        }
        Ok(self.ledger.run(self.run_id)?.status == RunStatus::Stopped)
    }

    async fn drive(&self, progress: &mut RunProgress) -> Result<()> {
        let steps = self.orchestration.steps();
        loop {
            let step = match progress.next(self.stop_requested()?) {
                NextStep::Launch(index) => &steps[index],
                NextStep::Abort => {
                    info!(
                        run_id = self.run_id,
                        attempted = progress.attempted(),
                        "stop observed; launching no further steps"
                    );
                    return Ok(());
                }
                NextStep::Done => return Ok(()),
            };

            self.ledger.update_run(self.run_id, |r| {
                r.begin_step();
            })?;
            debug!(run_id = self.run_id, step = step.order, script = %step.script.name, "launching step");

            let record = self
                .backend
                .run_step(StepRequest {
                    run_id: self.run_id,
                    step: step.clone(),
                    device: self.device.clone(),
                })
                .await?;
            progress.record(record.step_order, record.status);

            let stdout = record.stdout_section();
            let stderr = record.stderr_section();
            let mut appended = false;
            self.ledger.update_run(self.run_id, |r| {
                // A stopped run is closed; its buffers end with the stop note.
                if r.is_terminal() {
                    return;
                }
                r.stdout.push_str(&stdout);
                r.stderr.push_str(&stderr);
                appended = true;
            })?;
            if !appended {
                debug!(
                    run_id = self.run_id,
                    step = step.order,
                    "run already terminal; step output kept on the step record only"
                );
            }
        }
    }

    fn finalize(
        &self,
        progress: &RunProgress,
        outcome: Result<()>,
        elapsed: Duration,
    ) -> Result<RunStatus> {
        let bookkeeping_error = outcome.err().map(|e| e.to_string());
        let current = self.ledger.run(self.run_id)?;
        let stopped = progress.aborted()
            || current.status == RunStatus::Stopped
            || self.registry.is_cancelled(self.run_id);

        let failing = if bookkeeping_error.is_some() {
            progress.failing()
        } else {
            self.ledger
                .steps_of(self.run_id)?
                .iter()
                .filter(|s| s.status.is_failure())
                .count()
        };

        let verdict = conclude(stopped, failing, bookkeeping_error.as_deref());
        let run = self.ledger.update_run(self.run_id, |r| {
            let transitioned = match verdict.status {
                RunStatus::Stopped => mark_run_stopped(r),
                status => r.finish(status, elapsed),
            };
            if !transitioned {
                r.settle_duration(elapsed);
                return;
            }
            r.duration_secs = Some(elapsed.as_secs_f64());
            if let Some(msg) = &verdict.error_msg {
                r.error_msg = Some(msg.clone());
            }
            if verdict.status == RunStatus::Failed {
                if let Some(err) = &bookkeeping_error {
                    r.stderr.push_str(&format!("\n编排任务全局错误：{err}\n"));
                }
            }
        })?;

        if verdict.close_leftovers {
            let closed = close_open_steps(&self.ledger, self.run_id)?;
            if closed > 0 {
                debug!(run_id = self.run_id, closed, "closed open step records");
            }
        }
        self.registry.release_run(self.run_id);

        info!(
            run_id = self.run_id,
            status = %run.status,
            failing,
            attempted = progress.attempted(),
            duration_secs = ?run.duration_secs,
            "run finished"
        );
        Ok(run.status)
    }
}
