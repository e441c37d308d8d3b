// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::RunKey;
use crate::types::{RunId, RunStatus};

/// Why an external process could not be started.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(PathBuf),

    #[error("OS refused to start '{program}': {source}")]
    Os {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DroidflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Run key already registered: {0}")]
    DuplicateKey(RunKey),

    #[error("Run {0} is being cancelled")]
    Cancelled(RunId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Orchestration '{0}' has no steps configured")]
    NoStepsConfigured(String),

    #[error("No online devices among {requested:?} (filtered: {filtered:?})")]
    NoOnlineDevices {
        requested: Vec<String>,
        filtered: Vec<String>,
    },

    #[error("Orchestration '{0}' is not active")]
    OrchestrationInactive(String),

    #[error("Run {run_id} is not running (status: {status})")]
    NotRunning { run_id: RunId, status: RunStatus },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DroidflowError>;
