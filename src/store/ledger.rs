// src/store/ledger.rs

//! Store writes paired with log-update notifications.
//!
//! Every component that mutates a record goes through [`RunLedger`], so
//! subscribers see each buffer change without relying on store hooks.

use std::sync::Arc;

use crate::errors::{DroidflowError, Result};
use crate::exec::process::{OutputLine, StreamKind};
use crate::notify::{LogHub, LogUpdate};
use crate::record::{RunRecord, RunSnapshot, StepRunRecord};
use crate::types::{RunId, StepLogId};

use super::RunStore;

#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn RunStore>,
    hub: LogHub,
}

impl std::fmt::Debug for RunLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLedger").field("hub", &self.hub).finish_non_exhaustive()
    }
}

impl RunLedger {
    pub fn new(store: Arc<dyn RunStore>, hub: LogHub) -> Self {
        Self { store, hub }
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    pub fn create_run(&self, run: RunRecord) -> Result<RunRecord> {
        let run = self.store.insert_run(run)?;
        self.hub.publish(&LogUpdate::for_run(&run));
        Ok(run)
    }

    pub fn run(&self, id: RunId) -> Result<RunRecord> {
        self.store
            .get_run(id)?
            .ok_or_else(|| DroidflowError::NotFound(format!("run {id}")))
    }

    pub fn update_run(&self, id: RunId, f: impl FnOnce(&mut RunRecord)) -> Result<RunRecord> {
        let mut f = Some(f);
        let run = self.store.update_run(id, &mut |r: &mut RunRecord| {
            if let Some(f) = f.take() {
                f(r)
            }
        })?;
        self.hub.publish(&LogUpdate::for_run(&run));
        Ok(run)
    }

    pub fn create_step(&self, step: StepRunRecord) -> Result<StepRunRecord> {
        let step = self.store.insert_step(step)?;
        self.hub.publish(&LogUpdate::for_step(&step));
        Ok(step)
    }

    pub fn update_step(
        &self,
        id: StepLogId,
        f: impl FnOnce(&mut StepRunRecord),
    ) -> Result<StepRunRecord> {
        let mut f = Some(f);
        let step = self.store.update_step(id, &mut |s: &mut StepRunRecord| {
            if let Some(f) = f.take() {
                f(s)
            }
        })?;
        self.hub.publish(&LogUpdate::for_step(&step));
        Ok(step)
    }

    /// Append one captured line to a step's buffers.
    pub fn append_output(&self, id: StepLogId, line: &OutputLine) -> Result<StepRunRecord> {
        self.update_step(id, |step| match line.stream {
            StreamKind::Stdout => step.push_stdout_line(&line.text),
            StreamKind::Stderr => step.push_stderr_line(&line.text),
        })
    }

    pub fn steps_of(&self, run_id: RunId) -> Result<Vec<StepRunRecord>> {
        self.store.steps_of(run_id)
    }

    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        self.store.list_runs()
    }

    pub fn snapshot(&self, run_id: RunId) -> Result<RunSnapshot> {
        Ok(RunSnapshot {
            run: self.run(run_id)?,
            steps: self.steps_of(run_id)?,
        })
    }
}
