// tests/gateway_processes.rs

//! End-to-end runs through the gateway with real `/bin/sh` steps.

#![cfg(unix)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use droidflow::catalog::Catalog;
use droidflow::devices::{DeviceEntry, StaticDeviceRegistry};
use droidflow::engine::{Gateway, GatewayParts};
use droidflow::errors::DroidflowError;
use droidflow::fs::{FileSystem, RealFileSystem};
use droidflow::notify::LogHub;
use droidflow::registry::RunKey;
use droidflow::store::{FileRunStore, RunLedger, RunStore};
use droidflow::types::{RunId, RunStatus, StepStatus};
use droidflow_test_utils::{
    init_tracing, with_deadline, with_timeout, CatalogBuilder, FakeStep, Harness, PolicyBuilder,
    ScriptedBackend, StepBuilder,
};

type TestResult = Result<(), Box<dyn Error>>;

fn devices() -> Vec<DeviceEntry> {
    let mut pixel = DeviceEntry::new("pixel");
    pixel.connection = "192.168.1.20:5555".to_string();
    vec![pixel]
}

async fn dispatch_one(gw: &Gateway, orchestration: &str) -> Result<RunId, DroidflowError> {
    let dispatch = gw
        .execute_for_devices(orchestration, &["pixel".to_string()])
        .await?;
    Ok(dispatch.run_ids()[0])
}

/// Poll until the given step of a run has a live registered process.
async fn wait_for_step(gw: &Gateway, run_id: RunId, order: u32) {
    let key = RunKey::new(run_id, order);
    with_timeout(async {
        while gw.registry().lookup(&key).is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
}

fn steps_catalog(h: &Harness, bodies: &[&str]) -> Catalog {
    let steps = bodies
        .iter()
        .enumerate()
        .map(|(i, body)| {
            let order = i as u32 + 1;
            let script = h.script(&format!("step{order}"), body);
            StepBuilder::new(order, script).build()
        })
        .collect();
    CatalogBuilder::new().orchestration("flow", steps).build()
}

#[tokio::test]
async fn three_quick_steps_complete() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let catalog = steps_catalog(&h, &["echo one", "echo two", "echo three"]);
    let gw = h.gateway(catalog, devices());

    let run_id = dispatch_one(&gw, "flow").await?;
    assert_eq!(with_timeout(gw.wait(run_id)).await?, RunStatus::Completed);

    let snap = gw.status(run_id)?;
    assert_eq!(snap.run.completed_steps, 3);
    assert_eq!(snap.failing_steps(), 0);
    assert!(snap.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(
        snap.run.exec_command,
        "编排任务批量执行：flow - 设备：192.168.1.20:5555"
    );
    for (i, word) in ["one", "two", "three"].iter().enumerate() {
        let n = i + 1;
        assert!(snap.run.stdout.contains(&format!("=== 步骤{n}开始执行 ===")));
        assert!(snap.run.stdout.contains(&format!("{word}\n步骤{n}执行成功，返回码：0")));
    }
    let stdout: String = snap.steps.iter().map(|s| s.stdout_section()).collect();
    assert_eq!(snap.run.stdout, stdout);
    Ok(())
}

#[tokio::test]
async fn failing_first_step_gives_part_failed() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let catalog = steps_catalog(&h, &["echo nope >&2\nexit 1", "echo fine"]);
    let gw = h.gateway(catalog, devices());

    let run_id = dispatch_one(&gw, "flow").await?;
    assert_eq!(with_timeout(gw.wait(run_id)).await?, RunStatus::PartFailed);

    let snap = gw.status(run_id)?;
    assert!(snap
        .run
        .error_msg
        .as_deref()
        .is_some_and(|m| m.contains("1 步骤")));
    assert_eq!(snap.steps[0].status, StepStatus::Failed);
    assert_eq!(snap.steps[1].status, StepStatus::Completed);
    assert!(snap.run.stderr.contains("nope\n步骤1执行失败，返回码：1"));
    Ok(())
}

#[tokio::test]
async fn stop_during_second_step() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let catalog = steps_catalog(&h, &["echo one", "echo two\nsleep 30", "echo three"]);
    let gw = h.gateway(catalog, devices());

    let run_id = dispatch_one(&gw, "flow").await?;
    wait_for_step(&gw, run_id, 2).await;

    let report = with_deadline(Duration::from_secs(10), gw.stop(run_id)).await?;
    assert!(!report.already_stopping);
    assert_eq!(report.processes, 1);
    assert_eq!(with_timeout(gw.wait(run_id)).await?, RunStatus::Stopped);

    let snap = gw.status(run_id)?;
    assert_eq!(snap.steps.len(), 2, "step 3 must never be created");
    assert_eq!(snap.steps[0].status, StepStatus::Completed);
    assert_eq!(snap.steps[1].status, StepStatus::Stopped);
    assert_eq!(snap.run.completed_steps, 2);
    assert!(snap.run.stderr.contains("任务已手动停止 - 时间："));
    assert!(h.registry.is_empty());

    // A second stop finds a terminal run and does nothing.
    assert!(matches!(
        gw.stop(run_id).await,
        Err(DroidflowError::NotRunning { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn script_sees_the_cancel_flag_and_exits_on_its_own() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let catalog = steps_catalog(
        &h,
        &[r#"echo "watching $DROIDFLOW_CANCEL_FLAG"
i=0
while [ $i -lt 300 ]; do
  if [ -f "$DROIDFLOW_CANCEL_FLAG" ]; then
    echo "flag seen: $(head -n 1 "$DROIDFLOW_CANCEL_FLAG")"
    exit 0
  fi
  sleep 0.1
  i=$((i+1))
done
exit 1"#],
    );
    let gw = h.gateway(catalog, devices());

    let run_id = dispatch_one(&gw, "flow").await?;
    wait_for_step(&gw, run_id, 1).await;

    let report = with_deadline(Duration::from_secs(10), gw.stop(run_id)).await?;
    assert_eq!(report.forced, 0);
    assert_eq!(with_timeout(gw.wait(run_id)).await?, RunStatus::Stopped);

    let snap = gw.status(run_id)?;
    assert_eq!(snap.steps[0].status, StepStatus::Stopped);
    assert!(snap.steps[0].stdout.contains("flag seen: stop"));
    assert!(!h.flags.is_raised("pixel"));
    Ok(())
}

#[tokio::test]
async fn second_concurrent_stop_is_a_no_op() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let catalog = steps_catalog(&h, &["sleep 30"]);
    let gw = h.gateway(catalog, devices());

    let run_id = dispatch_one(&gw, "flow").await?;
    wait_for_step(&gw, run_id, 1).await;

    let first = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.stop(run_id).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = gw.stop(run_id).await?;
    assert!(second.already_stopping);
    assert_eq!(second.processes, 0);

    let first = with_deadline(Duration::from_secs(10), first).await??;
    assert!(!first.already_stopping);
    assert_eq!(with_timeout(gw.wait(run_id)).await?, RunStatus::Stopped);
    Ok(())
}

#[tokio::test]
async fn file_store_keeps_runs_across_reopen() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store_dir = dir.path().join("runs");
    let policy = PolicyBuilder::new(dir.path().join("flags"))
        .store_dir(&store_dir)
        .build();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let store: Arc<dyn RunStore> = Arc::new(FileRunStore::open(Arc::clone(&fs), &store_dir)?);
    let ledger = RunLedger::new(store, LogHub::new());
    let registry = droidflow::registry::RunRegistry::new();
    let backend = ScriptedBackend::new(ledger.clone(), registry.clone())
        .with_step(2, FakeStep::new(StepStatus::Failed).stdout("two"));
    let catalog = CatalogBuilder::new()
        .orchestration(
            "flow",
            vec![
                StepBuilder::named(1, "a").build(),
                StepBuilder::named(2, "b").build(),
            ],
        )
        .build();
    let gw = Gateway::new(
        GatewayParts {
            catalog,
            devices: Arc::new(StaticDeviceRegistry::new(devices())),
            ledger,
            registry,
            flags: droidflow::registry::flags::CancelFlags::new(
                Arc::clone(&fs),
                policy.flag_dir.clone(),
                policy.cancel_flag_ttl,
            ),
            policy,
        },
        Arc::new(backend),
    );

    let run_id = dispatch_one(&gw, "flow").await?;
    assert_eq!(with_timeout(gw.wait(run_id)).await?, RunStatus::PartFailed);
    let before = gw.status(run_id)?;

    let reopened = FileRunStore::open(fs, &store_dir)?;
    let run = reopened.get_run(run_id)?.expect("run persisted");
    assert_eq!(run.status, RunStatus::PartFailed);
    assert_eq!(run.stdout, before.run.stdout);
    assert_eq!(run.error_msg, before.run.error_msg);
    assert_eq!(run.completed_steps, 2);
    let steps = reopened.steps_of(run_id)?;
    let statuses: Vec<StepStatus> = steps.iter().map(|s| s.status).collect();
    assert_eq!(statuses, vec![StepStatus::Completed, StepStatus::Failed]);
    assert_eq!(steps[1].stdout, "two\n");
    assert!(store_dir.join(format!("run-{run_id}.json")).is_file());
    Ok(())
}
