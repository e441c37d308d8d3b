// src/exec/mod.rs

//! Process execution layer.
//!
//! - [`process`] spawns one script process, streams its output and tears
//!   down its whole process group on demand.
//! - [`interpreter`] resolves the interpreter and builds the invocation.
//! - [`step_runner`] runs one orchestration step to a terminal record.
//! - [`backend`] provides the `StepBackend` trait the coordinator drives;
//!   [`StepExecutor`] is the production implementation and tests can swap
//!   in a fake.

pub mod backend;
pub mod interpreter;
pub mod process;
pub mod step_runner;

pub use backend::{DeviceTarget, StepBackend, StepRequest};
pub use process::{spawn, CommandSpec, ProcessHandle, ProcessTree, WaitOutcome};
pub use step_runner::StepExecutor;
