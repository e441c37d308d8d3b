// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a persisted run record.
pub type RunId = u64;

/// Identifier of a persisted step record.
pub type StepLogId = u64;

/// Lifecycle of an orchestration definition.
///
/// Only `Active` definitions may be dispatched; `Draft` ones are still being
/// edited and `Disabled` ones are kept for history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Disabled,
}

impl Default for DefinitionStatus {
    fn default() -> Self {
        DefinitionStatus::Draft
    }
}

impl FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(DefinitionStatus::Draft),
            "active" => Ok(DefinitionStatus::Active),
            "disabled" => Ok(DefinitionStatus::Disabled),
            other => Err(format!(
                "invalid orchestration status: {other} (expected \"draft\", \"active\" or \"disabled\")"
            )),
        }
    }
}

/// Aggregate status of one run (one orchestration against one device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    PartFailed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::PartFailed => "part_failed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one step attempt.
///
/// `Pending` and `Running` are the only non-terminal states; once any other
/// state is set it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Timeout,
    Failed,
    Stopped,
    Error,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Statuses counted against a run when deciding `part_failed`.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::Timeout | StepStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Timeout => "timeout",
            StepStatus::Failed => "failed",
            StepStatus::Stopped => "stopped",
            StepStatus::Error => "error",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
