// src/record.rs

//! Durable execution records.
//!
//! A [`RunRecord`] describes one orchestration run against one device; a
//! [`StepRunRecord`] describes one step attempt inside it. Both enforce the
//! one-shot terminal transition themselves so every writer (coordinator,
//! executor, stop path) gets "first terminal write wins" for free.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RunId, RunStatus, StepLogId, StepStatus};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub orchestration: String,
    pub device_id: String,
    pub device_connection: String,
    pub status: RunStatus,
    /// Human-readable launch description.
    pub exec_command: String,
    pub stdout: String,
    pub stderr: String,
    pub total_steps: u32,
    /// Progress counter, bumped when a step *starts*.
    pub completed_steps: u32,
    pub error_msg: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

impl RunRecord {
    /// A fresh `running` record. The id is assigned by the store.
    pub fn new(
        orchestration: impl Into<String>,
        device_id: impl Into<String>,
        device_connection: impl Into<String>,
        total_steps: u32,
    ) -> Self {
        let orchestration = orchestration.into();
        let device_connection = device_connection.into();
        Self {
            id: 0,
            exec_command: format!("编排任务批量执行：{orchestration} - 设备：{device_connection}"),
            orchestration,
            device_id: device_id.into(),
            device_connection,
            status: RunStatus::Running,
            stdout: String::new(),
            stderr: String::new(),
            total_steps,
            completed_steps: 0,
            error_msg: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bump the progress counter for a step that is about to start.
    ///
    /// Returns `false` (and leaves the counter alone) if it would exceed
    /// `total_steps`.
    pub fn begin_step(&mut self) -> bool {
        if self.completed_steps >= self.total_steps {
            return false;
        }
        self.completed_steps += 1;
        true
    }

    /// Move to a terminal status, stamping end time and duration.
    ///
    /// No-op returning `false` if the record is already terminal or `status`
    /// is `Running`.
    pub fn finish(&mut self, status: RunStatus, duration: Duration) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.duration_secs = Some(duration.as_secs_f64());
        true
    }

    /// Fill in the duration of an already-terminal record that was stopped
    /// from outside the coordinator.
    pub fn settle_duration(&mut self, duration: Duration) {
        if self.duration_secs.is_none() {
            self.duration_secs = Some(duration.as_secs_f64());
        }
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRunRecord {
    pub id: StepLogId,
    pub run_id: RunId,
    pub step_order: u32,
    pub script: String,
    pub timeout_secs: u64,
    pub status: StepStatus,
    pub command: Option<String>,
    pub working_dir: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error_msg: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

impl StepRunRecord {
    pub fn new(run_id: RunId, step_order: u32, script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: 0,
            run_id,
            step_order,
            script: script.into(),
            timeout_secs: timeout.as_secs(),
            status: StepStatus::Pending,
            command: None,
            working_dir: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error_msg: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `pending -> running`. Any other starting state is left untouched.
    pub fn mark_running(&mut self) -> bool {
        if self.status != StepStatus::Pending {
            return false;
        }
        self.status = StepStatus::Running;
        true
    }

    /// Set the terminal status exactly once.
    pub fn finish(&mut self, status: StepStatus, duration: Duration) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.duration_secs = Some(duration.as_secs_f64());
        true
    }

    pub fn push_stdout_line(&mut self, line: &str) {
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }

    pub fn push_stderr_line(&mut self, line: &str) {
        self.stderr.push_str(line);
        self.stderr.push('\n');
    }

    /// This step's contribution to the run's combined stdout.
    pub fn stdout_section(&self) -> String {
        let n = self.step_order;
        let mut out = String::new();
        out.push_str(&format!("\n=== 步骤{n}开始执行 ===\n"));
        out.push_str(&format!(
            "执行命令：{}\n",
            self.command.as_deref().unwrap_or("-")
        ));
        out.push_str(&format!(
            "工作目录：{}\n",
            self.working_dir.as_deref().unwrap_or("-")
        ));
        out.push_str(&format!(
            "开始时间：{}\n",
            self.started_at.format(TIME_FORMAT)
        ));
        out.push_str(&self.stdout);
        let outcome = match self.status {
            StepStatus::Completed => format!(
                "步骤{n}执行成功，返回码：{}",
                self.exit_code.unwrap_or(0)
            ),
            StepStatus::Failed => format!(
                "步骤{n}执行失败，返回码：{}",
                self.exit_code.unwrap_or(-1)
            ),
            StepStatus::Timeout => format!("步骤{n}执行超时（{}秒）", self.timeout_secs),
            StepStatus::Stopped => format!("步骤{n}已停止"),
            StepStatus::Error => format!("步骤{n}系统错误"),
            StepStatus::Pending | StepStatus::Running => format!("步骤{n}执行中"),
        };
        out.push_str(&outcome);
        out.push('\n');
        out
    }

    /// This step's contribution to the run's combined stderr.
    pub fn stderr_section(&self) -> String {
        let n = self.step_order;
        let mut out = self.stderr.clone();
        let note = match self.status {
            StepStatus::Failed => Some(format!(
                "步骤{n}执行失败，返回码：{}",
                self.exit_code.unwrap_or(-1)
            )),
            StepStatus::Timeout => Some(format!("步骤{n}超时：强制终止进程")),
            StepStatus::Error => Some(format!(
                "步骤{n}系统错误：{}",
                self.error_msg
                    .as_deref()
                    .and_then(|m| m.lines().find(|l| !l.trim().is_empty()))
                    .unwrap_or("未知错误")
            )),
            _ => None,
        };
        if let Some(note) = note {
            out.push_str(&note);
            out.push('\n');
        }
        out
    }
}

/// Read-only projection handed out by the gateway's status call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: RunRecord,
    /// Step records in execution order.
    pub steps: Vec<StepRunRecord>,
}

impl RunSnapshot {
    pub fn failing_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_failure()).count()
    }
}
