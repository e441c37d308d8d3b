use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidflow::errors::{DroidflowError, Result};
use droidflow::exec::{StepBackend, StepRequest};
use droidflow::record::StepRunRecord;
use droidflow::registry::RunRegistry;
use droidflow::store::RunLedger;
use droidflow::types::{RunId, StepStatus};

/// How the fake resolves one step order.
#[derive(Debug, Clone)]
pub struct FakeStep {
    pub status: StepStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Simulated run time. A run cancelled meanwhile resolves `stopped`.
    pub delay: Duration,
    /// Return a bookkeeping error instead of a record.
    pub bookkeeping_error: bool,
}

impl FakeStep {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: Vec::new(),
            delay: Duration::ZERO,
            bookkeeping_error: false,
        }
    }

    pub fn stdout(mut self, line: &str) -> Self {
        self.stdout.push(line.to_string());
        self
    }

    pub fn stderr(mut self, line: &str) -> Self {
        self.stderr.push(line.to_string());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn bookkeeping_error() -> Self {
        Self {
            bookkeeping_error: true,
            ..Self::new(StepStatus::Error)
        }
    }
}

/// One recorded `run_step` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub run_id: RunId,
    pub step_order: u32,
    pub device_id: String,
    /// The run's progress counter when the step was handed over.
    pub completed_steps_at_start: u32,
}

/// A `StepBackend` that writes scripted outcomes through the ledger
/// without spawning anything. Unscripted orders complete immediately.
pub struct ScriptedBackend {
    ledger: RunLedger,
    registry: RunRegistry,
    steps: HashMap<u32, FakeStep>,
    calls: Arc<Mutex<Vec<FakeCall>>>,
}

impl ScriptedBackend {
    pub fn new(ledger: RunLedger, registry: RunRegistry) -> Self {
        Self {
            ledger,
            registry,
            steps: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_step(mut self, order: u32, step: FakeStep) -> Self {
        self.steps.insert(order, step);
        self
    }

    /// Shared handle to the recorded calls.
    pub fn calls(&self) -> Arc<Mutex<Vec<FakeCall>>> {
        Arc::clone(&self.calls)
    }

    async fn resolve(&self, request: StepRequest) -> Result<StepRunRecord> {
        let run = self.ledger.run(request.run_id)?;
        self.calls.lock().unwrap().push(FakeCall {
            run_id: request.run_id,
            step_order: request.step.order,
            device_id: request.device.id.clone(),
            completed_steps_at_start: run.completed_steps,
        });

        let script = self
            .steps
            .get(&request.step.order)
            .cloned()
            .unwrap_or_else(|| FakeStep::new(StepStatus::Completed));

        let record = self.ledger.create_step(StepRunRecord::new(
            request.run_id,
            request.step.order,
            request.step.script.name.clone(),
            request.step.timeout,
        ))?;
        if script.bookkeeping_error {
            return Err(DroidflowError::Persistence("fake store unavailable".into()));
        }
        self.ledger.update_step(record.id, |s| {
            s.command = Some(format!("fake {}", request.step.script.name));
            s.mark_running();
        })?;

        let mut status = script.status;
        let deadline = tokio::time::Instant::now() + script.delay;
        while tokio::time::Instant::now() < deadline {
            if self.registry.is_cancelled(request.run_id) {
                status = StepStatus::Stopped;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.ledger.update_step(record.id, |s| {
            for line in &script.stdout {
                s.push_stdout_line(line);
            }
            for line in &script.stderr {
                s.push_stderr_line(line);
            }
            if s.finish(status, script.delay) {
                s.exit_code = match status {
                    StepStatus::Completed => Some(0),
                    StepStatus::Failed => Some(1),
                    _ => None,
                };
            }
        })
    }
}

impl StepBackend for ScriptedBackend {
    fn run_step(
        &self,
        request: StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StepRunRecord>> + Send + '_>> {
        Box::pin(self.resolve(request))
    }
}
