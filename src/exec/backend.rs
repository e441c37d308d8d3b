// src/exec/backend.rs

//! Pluggable step backend abstraction.
//!
//! The coordinator talks to a `StepBackend` instead of the step executor
//! directly. Production uses [`super::StepExecutor`]; tests can provide a
//! backend that records requests and resolves steps without spawning
//! processes.

use std::future::Future;
use std::pin::Pin;

use crate::catalog::Step;
use crate::errors::Result;
use crate::record::StepRunRecord;
use crate::types::RunId;

/// The device a run targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub id: String,
    /// Passed to the script as its argument (serial or `host:port`).
    pub connection: String,
}

#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: RunId,
    pub step: Step,
    pub device: DeviceTarget,
}

pub trait StepBackend: Send + Sync {
    /// Run one step to a terminal state and return its final record.
    ///
    /// Expected outcomes (nonzero exit, timeout, cancellation, missing
    /// script) come back as `Ok` with the matching step status. `Err` means
    /// the run's bookkeeping itself failed.
    fn run_step(
        &self,
        request: StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StepRunRecord>> + Send + '_>>;
}
