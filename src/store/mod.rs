// src/store/mod.rs

//! Persistence of run and step records.
//!
//! Stores are synchronous and cheap; callers never hold a store borrow
//! across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::errors::{DroidflowError, Result};
use crate::record::{RunRecord, StepRunRecord};
use crate::types::{RunId, StepLogId};

pub mod file;
pub mod ledger;

pub use file::FileRunStore;
pub use ledger::RunLedger;

pub trait RunStore: Send + Sync {
    /// Persist a new run and assign its id.
    fn insert_run(&self, run: RunRecord) -> Result<RunRecord>;
    fn get_run(&self, id: RunId) -> Result<Option<RunRecord>>;
    /// Apply `f` to the stored run and persist the result.
    fn update_run(&self, id: RunId, f: &mut dyn FnMut(&mut RunRecord)) -> Result<RunRecord>;
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    /// Persist a new step record and assign its id.
    fn insert_step(&self, step: StepRunRecord) -> Result<StepRunRecord>;
    fn update_step(
        &self,
        id: StepLogId,
        f: &mut dyn FnMut(&mut StepRunRecord),
    ) -> Result<StepRunRecord>;
    /// Step records of a run in execution order.
    fn steps_of(&self, run_id: RunId) -> Result<Vec<StepRunRecord>>;
}

/// Record tables shared by the in-memory and file stores.
#[derive(Debug, Default)]
pub(crate) struct RecordTables {
    pub(crate) runs: BTreeMap<RunId, RunRecord>,
    pub(crate) steps: BTreeMap<StepLogId, StepRunRecord>,
}

impl RecordTables {
    fn next_run_id(&self) -> RunId {
        self.runs.keys().next_back().map_or(1, |id| id + 1)
    }

    fn next_step_id(&self) -> StepLogId {
        self.steps.keys().next_back().map_or(1, |id| id + 1)
    }

    pub(crate) fn insert_run(&mut self, mut run: RunRecord) -> RunRecord {
        run.id = self.next_run_id();
        self.runs.insert(run.id, run.clone());
        run
    }

    pub(crate) fn update_run(
        &mut self,
        id: RunId,
        f: &mut dyn FnMut(&mut RunRecord),
    ) -> Result<RunRecord> {
        let run = self
            .runs
            .get_mut(&id)
            .ok_or_else(|| DroidflowError::NotFound(format!("run {id}")))?;
        f(run);
        Ok(run.clone())
    }

    pub(crate) fn insert_step(&mut self, mut step: StepRunRecord) -> Result<StepRunRecord> {
        if !self.runs.contains_key(&step.run_id) {
            return Err(DroidflowError::NotFound(format!("run {}", step.run_id)));
        }
        step.id = self.next_step_id();
        self.steps.insert(step.id, step.clone());
        Ok(step)
    }

    pub(crate) fn update_step(
        &mut self,
        id: StepLogId,
        f: &mut dyn FnMut(&mut StepRunRecord),
    ) -> Result<StepRunRecord> {
        let step = self
            .steps
            .get_mut(&id)
            .ok_or_else(|| DroidflowError::NotFound(format!("step log {id}")))?;
        f(step);
        Ok(step.clone())
    }

    pub(crate) fn steps_of(&self, run_id: RunId) -> Vec<StepRunRecord> {
        let mut steps: Vec<StepRunRecord> = self
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| (s.step_order, s.id));
        steps
    }
}

/// Volatile store; records live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    tables: Mutex<RecordTables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, RecordTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RunStore for MemoryRunStore {
    fn insert_run(&self, run: RunRecord) -> Result<RunRecord> {
        Ok(self.tables().insert_run(run))
    }

    fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        Ok(self.tables().runs.get(&id).cloned())
    }

    fn update_run(&self, id: RunId, f: &mut dyn FnMut(&mut RunRecord)) -> Result<RunRecord> {
        self.tables().update_run(id, f)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.tables().runs.values().cloned().collect())
    }

    fn insert_step(&self, step: StepRunRecord) -> Result<StepRunRecord> {
        self.tables().insert_step(step)
    }

    fn update_step(
        &self,
        id: StepLogId,
        f: &mut dyn FnMut(&mut StepRunRecord),
    ) -> Result<StepRunRecord> {
        self.tables().update_step(id, f)
    }

    fn steps_of(&self, run_id: RunId) -> Result<Vec<StepRunRecord>> {
        Ok(self.tables().steps_of(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ids_are_assigned_monotonically() {
        let store = MemoryRunStore::new();
        let a = store.insert_run(RunRecord::new("o", "d1", "d1", 1)).unwrap();
        let b = store.insert_run(RunRecord::new("o", "d2", "d2", 1)).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
    }

    #[test]
    fn steps_of_is_sorted_by_order() {
        let store = MemoryRunStore::new();
        let run = store.insert_run(RunRecord::new("o", "d", "d", 2)).unwrap();
        store
            .insert_step(StepRunRecord::new(run.id, 2, "b", Duration::from_secs(10)))
            .unwrap();
        store
            .insert_step(StepRunRecord::new(run.id, 1, "a", Duration::from_secs(10)))
            .unwrap();
        let orders: Vec<u32> = store
            .steps_of(run.id)
            .unwrap()
            .iter()
            .map(|s| s.step_order)
            .collect();
        assert_eq!(orders, vec![1, 2]);
    }

    #[test]
    fn step_for_unknown_run_is_rejected() {
        let store = MemoryRunStore::new();
        let err = store
            .insert_step(StepRunRecord::new(99, 1, "a", Duration::from_secs(10)))
            .unwrap_err();
        assert!(matches!(err, DroidflowError::NotFound(_)));
    }

    #[test]
    fn update_missing_run_is_not_found() {
        let store = MemoryRunStore::new();
        let err = store.update_run(7, &mut |_: &mut RunRecord| {}).unwrap_err();
        assert!(matches!(err, DroidflowError::NotFound(_)));
    }
}
