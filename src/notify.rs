// src/notify.rs

//! Push-style "log updated" events.
//!
//! The ledger calls [`LogHub::publish`] at every buffer mutation point;
//! observers are plain trait objects registered per run id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::record::{RunRecord, StepRunRecord};
use crate::types::{RunId, StepLogId};

/// Which buffer changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogSource {
    Run,
    Step { step_log_id: StepLogId, step_order: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogUpdate {
    pub run_id: RunId,
    pub source: LogSource,
    pub stdout: String,
    pub stderr: String,
    pub status: String,
}

impl LogUpdate {
    pub fn for_run(run: &RunRecord) -> Self {
        Self {
            run_id: run.id,
            source: LogSource::Run,
            stdout: run.stdout.clone(),
            stderr: run.stderr.clone(),
            status: run.status.to_string(),
        }
    }

    pub fn for_step(step: &StepRunRecord) -> Self {
        Self {
            run_id: step.run_id,
            source: LogSource::Step {
                step_log_id: step.id,
                step_order: step.step_order,
            },
            stdout: step.stdout.clone(),
            stderr: step.stderr.clone(),
            status: step.status.to_string(),
        }
    }
}

pub trait LogObserver: Send + Sync {
    fn log_updated(&self, update: &LogUpdate);

    /// Observers that report closed are dropped on the next publish.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> LogObserver for F
where
    F: Fn(&LogUpdate) + Send + Sync,
{
    fn log_updated(&self, update: &LogUpdate) {
        self(update)
    }
}

/// Forwards updates into an unbounded channel.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<LogUpdate>,
}

impl LogObserver for ChannelObserver {
    fn log_updated(&self, update: &LogUpdate) {
        let _ = self.tx.send(update.clone());
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type Subscribers = HashMap<RunId, Vec<Arc<dyn LogObserver>>>;

#[derive(Clone, Default)]
pub struct LogHub {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl std::fmt::Debug for LogHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runs: Vec<RunId> = self.lock().keys().copied().collect();
        f.debug_struct("LogHub").field("runs", &runs).finish()
    }
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, run_id: RunId, observer: Arc<dyn LogObserver>) {
        self.lock().entry(run_id).or_default().push(observer);
    }

    pub fn subscribe(&self, run_id: RunId) -> mpsc::UnboundedReceiver<LogUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(run_id, Arc::new(ChannelObserver { tx }));
        rx
    }

    /// Drop every observer of a run.
    pub fn clear(&self, run_id: RunId) {
        self.lock().remove(&run_id);
    }

    pub fn subscriber_count(&self, run_id: RunId) -> usize {
        self.lock().get(&run_id).map_or(0, Vec::len)
    }

    pub fn publish(&self, update: &LogUpdate) {
        // Observers run outside the lock so they may register/subscribe.
        let observers = {
            let mut subs = self.lock();
            let Some(list) = subs.get_mut(&update.run_id) else {
                return;
            };
            list.retain(|o| !o.is_closed());
            list.clone()
        };
        for observer in observers {
            observer.log_updated(update);
        }
    }
}
