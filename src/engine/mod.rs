// src/engine/mod.rs

//! Orchestration engine for droidflow.
//!
//! This module ties together:
//! - the pure run bookkeeping in [`progress`] (which step next, final status)
//! - the per-run async shell in [`coordinator`]
//! - the dispatch / stop / status entry points in [`gateway`]

pub mod coordinator;
pub mod gateway;
pub mod progress;

pub use coordinator::Coordinator;
pub use gateway::{
    Dispatch, DispatchedRun, FilterReason, FilteredDevice, Gateway, GatewayParts, StopReport,
};
pub use progress::{conclude, NextStep, RunProgress, Verdict};
