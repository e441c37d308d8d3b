// src/exec/step_runner.rs

//! Step executor: one script against one device, from `pending` to a
//! terminal status.
//!
//! Expected outcomes (nonzero exit, timeout, cancellation, missing script,
//! spawn failure) are written into the step record and returned as `Ok`.
//! Only failures of the ledger itself surface as `Err`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::Step;
use crate::config::ExecutionPolicy;
use crate::errors::{DroidflowError, Result, SpawnError};
use crate::record::StepRunRecord;
use crate::registry::flags::CancelFlags;
use crate::registry::{RegisteredProcess, RunKey, RunRegistry};
use crate::store::RunLedger;
use crate::types::{RunId, StepLogId, StepStatus};

use super::backend::{DeviceTarget, StepBackend, StepRequest};
use super::interpreter::{build_invocation, resolve_interpreter};
use super::process::{self, OutputStream, WaitOutcome};

pub const STOPPED_NOTE: &str = "任务被手动停止";

/// Extra wait on top of the stop graces before the executor kills a
/// cancelled step itself.
const EXIT_SLACK: Duration = Duration::from_secs(2);

/// How a step ended, before it is written to its record.
#[derive(Debug)]
struct Resolution {
    status: StepStatus,
    exit_code: Option<i32>,
    error: Option<String>,
    /// Overrides wall-clock duration (timeouts record the configured limit).
    duration: Option<Duration>,
}

impl Resolution {
    fn new(status: StepStatus) -> Self {
        Self {
            status,
            exit_code: None,
            error: None,
            duration: None,
        }
    }

    fn error(detail: String) -> Self {
        Self::new(StepStatus::Error).with_error(detail)
    }

    fn with_exit(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error = Some(detail.into());
        self
    }
}

/// What was known about the step when something went wrong.
#[derive(Debug, Default)]
struct ExecContext {
    working_dir: Option<PathBuf>,
    interpreter: Option<PathBuf>,
    command: Option<String>,
    pid: Option<u32>,
}

impl ExecContext {
    fn diagnostics(&self, kind: &str, message: &str) -> String {
        let interpreter = match &self.interpreter {
            Some(p) => format!(
                "{}（存在：{}）",
                p.display(),
                if p.exists() { "是" } else { "否" }
            ),
            None => "-".to_string(),
        };
        format!(
            "{message}\n异常类型：{kind}\n工作目录：{}\n解释器：{interpreter}\n执行命令：{}\n进程ID：{}",
            self.working_dir
                .as_ref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string()),
            self.command.as_deref().unwrap_or("-"),
            self.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
        )
    }
}

fn spawn_error_kind(err: &SpawnError) -> &'static str {
    match err {
        SpawnError::ExecutableNotFound(_) => "SpawnError::ExecutableNotFound",
        SpawnError::WorkingDirMissing(_) => "SpawnError::WorkingDirMissing",
        SpawnError::Os { .. } => "SpawnError::Os",
    }
}

fn error_kind(err: &DroidflowError) -> &'static str {
    match err {
        DroidflowError::Spawn(e) => spawn_error_kind(e),
        DroidflowError::DuplicateKey(_) => "DuplicateKeyError",
        DroidflowError::Persistence(_) | DroidflowError::Json(_) => "PersistenceError",
        DroidflowError::IoError(_) => "IoError",
        DroidflowError::NotFound(_) => "NotFound",
        DroidflowError::Precondition(_) => "PreconditionError",
        _ => "UnexpectedError",
    }
}

/// Releases the registry key when dropped, whichever way the step ends.
struct Registration {
    registry: RunRegistry,
    key: RunKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.key);
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    ledger: RunLedger,
    registry: RunRegistry,
    flags: CancelFlags,
    policy: ExecutionPolicy,
}

impl StepExecutor {
    pub fn new(
        ledger: RunLedger,
        registry: RunRegistry,
        flags: CancelFlags,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            ledger,
            registry,
            flags,
            policy,
        }
    }

    pub async fn execute(&self, request: StepRequest) -> Result<StepRunRecord> {
        let StepRequest {
            run_id,
            step,
            device,
        } = request;
        let started = Instant::now();
        let record = self.ledger.create_step(StepRunRecord::new(
            run_id,
            step.order,
            step.script.name.clone(),
            step.timeout,
        ))?;

        let mut ctx = ExecContext::default();
        let resolution = match self.drive(run_id, &step, &device, record.id, &mut ctx).await {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(run_id, step = step.order, error = %e, "step failed unexpectedly");
                Resolution::error(ctx.diagnostics(error_kind(&e), &e.to_string()))
            }
        };

        let Resolution {
            status,
            exit_code,
            error,
            duration,
        } = resolution;
        let elapsed = duration.unwrap_or_else(|| started.elapsed());
        let finished = self.ledger.update_step(record.id, |s| {
            if s.finish(status, elapsed) {
                s.exit_code = exit_code;
                s.error_msg = error;
            }
        })?;

        info!(
            run_id,
            step = step.order,
            device = %device.id,
            status = %finished.status,
            exit_code = ?finished.exit_code,
            "step finished"
        );
        Ok(finished)
    }

    async fn drive(
        &self,
        run_id: RunId,
        step: &Step,
        device: &DeviceTarget,
        step_id: StepLogId,
        ctx: &mut ExecContext,
    ) -> Result<Resolution> {
        let script = &step.script;
        ctx.working_dir = Some(script.working_dir());

        if let Err(e) = script.ensure_exists() {
            warn!(
                run_id,
                step = step.order,
                path = %script.script_path.display(),
                "script file missing"
            );
            return match e {
                DroidflowError::Precondition(detail) => Ok(Resolution::error(detail)),
                other => Err(other),
            };
        }

        let interpreter =
            match resolve_interpreter(&script.interpreter, &self.policy.fallback_interpreters) {
                Ok(path) => path,
                Err(e) => {
                    ctx.interpreter = Some(script.interpreter.clone());
                    return Ok(Resolution::error(
                        ctx.diagnostics(spawn_error_kind(&e), &e.to_string()),
                    ));
                }
            };
        ctx.interpreter = Some(interpreter.clone());

        let flag_path = self.flags.path_for(&device.id);
        let spec = build_invocation(
            &interpreter,
            script,
            &device.id,
            &device.connection,
            &flag_path,
        );
        let command = spec.display();
        let working_dir = spec.working_dir.display().to_string();
        ctx.command = Some(command.clone());
        self.ledger.update_step(step_id, |s| {
            s.command = Some(command);
            s.working_dir = Some(working_dir);
            s.mark_running();
        })?;

        let mut handle = match process::spawn(&spec) {
            Ok(handle) => handle,
            Err(e) => {
                error!(run_id, step = step.order, error = %e, "failed to spawn step process");
                return Ok(Resolution::error(
                    ctx.diagnostics(spawn_error_kind(&e), &e.to_string()),
                ));
            }
        };
        ctx.pid = Some(handle.pid());

        let key = RunKey::new(run_id, step.order);
        let cancel = CancellationToken::new();
        let registered = self.registry.register(RegisteredProcess {
            key,
            tree: handle.tree(),
            device_id: device.id.clone(),
            cancel: cancel.clone(),
        });
        let _registration = match registered {
            Ok(()) => Registration {
                registry: self.registry.clone(),
                key,
            },
            Err(DroidflowError::Cancelled(_)) => {
                info!(run_id, step = step.order, "run stopped before step registered; terminating");
                handle.terminate(self.policy.terminate_grace).await;
                return Ok(Resolution::new(StepStatus::Stopped).with_error(STOPPED_NOTE));
            }
            Err(e) => {
                handle.terminate(self.policy.terminate_grace).await;
                return Err(e);
            }
        };

        let pump = handle
            .take_output()
            .map(|output| tokio::spawn(pump_output(output, self.ledger.clone(), step_id)));

        let resolution = match handle.wait(step.timeout, &cancel).await {
            Ok(WaitOutcome::Exited(0)) => Resolution::new(StepStatus::Completed).with_exit(0),
            Ok(WaitOutcome::Exited(code)) => Resolution::new(StepStatus::Failed)
                .with_exit(code)
                .with_error(format!("执行失败，返回码：{code}")),
            Ok(WaitOutcome::TimedOut) => {
                warn!(
                    run_id,
                    step = step.order,
                    timeout_secs = step.timeout.as_secs(),
                    "step timed out; terminating process tree"
                );
                handle.terminate(self.policy.terminate_grace).await;
                let mut resolution = Resolution::new(StepStatus::Timeout)
                    .with_error(format!("执行超时（{}秒）", step.timeout.as_secs()));
                resolution.duration = Some(step.timeout);
                resolution
            }
            Ok(WaitOutcome::Cancelled) => {
                info!(run_id, step = step.order, "step cancelled; waiting for script to exit");
                let ceiling = self.policy.stop_grace + self.policy.terminate_grace + EXIT_SLACK;
                let exit_code = match handle.wait_for_exit(ceiling).await {
                    Ok(Some(code)) => Some(code),
                    _ => {
                        handle.terminate(self.policy.terminate_grace).await;
                        None
                    }
                };
                if let Err(e) = self.flags.clear(&device.id) {
                    warn!(device = %device.id, error = %e, "failed to clear cancellation flag");
                }
                let mut resolution = Resolution::new(StepStatus::Stopped).with_error(STOPPED_NOTE);
                resolution.exit_code = exit_code;
                resolution
            }
            Err(e) => {
                handle.terminate(self.policy.terminate_grace).await;
                Resolution::error(ctx.diagnostics("IoError", &e.to_string()))
            }
        };

        let exited = matches!(resolution.status, StepStatus::Completed | StepStatus::Failed);
        if exited && handle.tree().is_alive() {
            warn!(
                run_id,
                step = step.order,
                pid = handle.pid(),
                "script exited but left processes in its group; terminating them"
            );
            handle.terminate(self.policy.terminate_grace).await;
        }

        if let Some(pump) = pump {
            self.drain(pump, step_id).await;
        }
        Ok(resolution)
    }

    /// Let the pump deliver buffered output. Helpers that escaped the
    /// process group can hold the pipes open, so this is bounded.
    async fn drain(&self, mut pump: JoinHandle<()>, step_id: StepLogId) {
        match timeout(self.policy.output_drain_timeout, &mut pump).await {
            Ok(Ok(())) => debug!(step_id, "output drained"),
            Ok(Err(e)) => warn!(step_id, error = %e, "output pump task failed"),
            Err(_) => {
                warn!(step_id, "output still open after drain timeout; detaching");
                pump.abort();
            }
        }
    }
}

async fn pump_output(mut output: OutputStream, ledger: RunLedger, step_id: StepLogId) {
    while let Some(line) = output.next().await {
        if let Err(e) = ledger.append_output(step_id, &line) {
            warn!(step_id, error = %e, "failed to persist output line");
        }
    }
}

impl StepBackend for StepExecutor {
    fn run_step(
        &self,
        request: StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StepRunRecord>> + Send + '_>> {
        Box::pin(self.execute(request))
    }
}
