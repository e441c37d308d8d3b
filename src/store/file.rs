// src/store/file.rs

//! JSON-file mirror of the record tables.
//!
//! Each run lives in `<dir>/run-<id>.json` together with its step records.
//! The file is rewritten after every mutation, so intermediate progress
//! survives a crash of this process.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{DroidflowError, Result};
use crate::fs::FileSystem;
use crate::record::{RunRecord, StepRunRecord};
use crate::types::{RunId, StepLogId};

use super::{RecordTables, RunStore};

#[derive(Debug, Serialize, Deserialize)]
struct RunFile {
    run: RunRecord,
    steps: Vec<StepRunRecord>,
}

#[derive(Debug)]
pub struct FileRunStore {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    tables: Mutex<RecordTables>,
}

impl FileRunStore {
    /// Open a store rooted at `dir`, loading any runs persisted there.
    ///
    /// Runs that were still `running` when their process died are loaded
    /// as-is.
    pub fn open(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut tables = RecordTables::default();

        if fs.is_dir(&dir) {
            for path in fs.read_dir(&dir)? {
                if !is_run_file(&path) {
                    continue;
                }
                let text = fs.read_to_string(&path)?;
                let file: RunFile = serde_json::from_str(&text).map_err(|e| {
                    DroidflowError::Persistence(format!("corrupt run file {:?}: {e}", path))
                })?;
                for step in file.steps {
                    tables.steps.insert(step.id, step);
                }
                tables.runs.insert(file.run.id, file.run);
            }
            info!(dir = %dir.display(), runs = tables.runs.len(), "loaded run store");
        } else {
            debug!(dir = %dir.display(), "run store directory does not exist yet");
        }

        Ok(Self {
            fs,
            dir,
            tables: Mutex::new(tables),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("run-{run_id}.json"))
    }

    fn tables(&self) -> MutexGuard<'_, RecordTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rewrite one run's file. Called with the table lock held so writes
    /// for the same run never interleave.
    fn flush(&self, tables: &RecordTables, run_id: RunId) -> Result<()> {
        let Some(run) = tables.runs.get(&run_id) else {
            warn!(run_id, "flush requested for unknown run");
            return Ok(());
        };
        let file = RunFile {
            run: run.clone(),
            steps: tables.steps_of(run_id),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        self.fs
            .write(&self.path_for(run_id), &json)
            .map_err(|e| DroidflowError::Persistence(format!("{e:#}")))
    }
}

fn is_run_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("run-") && n.ends_with(".json"))
}

impl RunStore for FileRunStore {
    fn insert_run(&self, run: RunRecord) -> Result<RunRecord> {
        let mut tables = self.tables();
        let run = tables.insert_run(run);
        if let Err(e) = self.flush(&tables, run.id) {
            tables.runs.remove(&run.id);
            return Err(e);
        }
        Ok(run)
    }

    fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        Ok(self.tables().runs.get(&id).cloned())
    }

    fn update_run(&self, id: RunId, f: &mut dyn FnMut(&mut RunRecord)) -> Result<RunRecord> {
        let mut tables = self.tables();
        let run = tables.update_run(id, f)?;
        self.flush(&tables, id)?;
        Ok(run)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.tables().runs.values().cloned().collect())
    }

    fn insert_step(&self, step: StepRunRecord) -> Result<StepRunRecord> {
        let mut tables = self.tables();
        let step = tables.insert_step(step)?;
        self.flush(&tables, step.run_id)?;
        Ok(step)
    }

    fn update_step(
        &self,
        id: StepLogId,
        f: &mut dyn FnMut(&mut StepRunRecord),
    ) -> Result<StepRunRecord> {
        let mut tables = self.tables();
        let step = tables.update_step(id, f)?;
        self.flush(&tables, step.run_id)?;
        Ok(step)
    }

    fn steps_of(&self, run_id: RunId) -> Result<Vec<StepRunRecord>> {
        Ok(self.tables().steps_of(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::types::{RunStatus, StepStatus};
    use std::time::Duration;

    #[test]
    fn records_survive_reopen() {
        let fs = MockFileSystem::new();
        let store = FileRunStore::open(Arc::new(fs.clone()), "runs").unwrap();
        let run = store.insert_run(RunRecord::new("o", "d", "d", 1)).unwrap();
        let step = store
            .insert_step(StepRunRecord::new(run.id, 1, "s", Duration::from_secs(10)))
            .unwrap();
        store
            .update_step(step.id, &mut |s: &mut StepRunRecord| {
                s.push_stdout_line("ok");
                s.finish(StepStatus::Completed, Duration::from_secs(1));
            })
            .unwrap();
        store
            .update_run(run.id, &mut |r: &mut RunRecord| {
                r.finish(RunStatus::Completed, Duration::from_secs(1));
            })
            .unwrap();

        let reopened = FileRunStore::open(Arc::new(fs.clone()), "runs").unwrap();
        let loaded = reopened.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        let steps = reopened.steps_of(run.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].stdout, "ok\n");

        // New ids continue after the loaded ones.
        let next = reopened
            .insert_run(RunRecord::new("o", "d", "d", 1))
            .unwrap();
        assert_eq!(next.id, run.id + 1);
    }

    #[test]
    fn corrupt_file_is_a_persistence_error() {
        let fs = MockFileSystem::new();
        fs.add_file("runs/run-1.json", "{not json");
        let err = FileRunStore::open(Arc::new(fs), "runs").unwrap_err();
        assert!(matches!(err, DroidflowError::Persistence(_)));
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let fs = MockFileSystem::new();
        fs.add_file("runs/notes.txt", "hello");
        let store = FileRunStore::open(Arc::new(fs), "runs").unwrap();
        assert!(store.list_runs().unwrap().is_empty());
    }
}
