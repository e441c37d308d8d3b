// src/lib.rs

pub mod catalog;
pub mod cli;
pub mod config;
pub mod devices;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod notify;
pub mod record;
pub mod registry;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::devices::StaticDeviceRegistry;
use crate::engine::{Gateway, GatewayParts};
use crate::fs::{FileSystem, RealFileSystem};
use crate::notify::LogHub;
use crate::registry::flags::CancelFlags;
use crate::registry::RunRegistry;
use crate::store::{FileRunStore, MemoryRunStore, RunLedger, RunStore};
use crate::types::RunStatus;

/// High-level entry point used by `main.rs`.
///
/// Loads the config, dispatches the requested orchestration, waits for
/// every run and prints each run's snapshot as JSON. Returns whether every
/// run completed.
pub async fn run(args: CliArgs) -> Result<bool> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if args.dry_run {
        print_dry_run(&cfg, &args);
        return Ok(true);
    }

    let gateway = build_gateway(cfg)?;

    // Ctrl-C stops everything still in flight.
    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupt received; stopping in-flight runs");
            gateway.stop_all().await;
        });
    }

    let run_ids = if args.devices.is_empty() {
        vec![gateway.execute_scheduled(&args.orchestration, None).await?.run_id]
    } else {
        let dispatch = gateway
            .execute_for_devices(&args.orchestration, &args.devices)
            .await?;
        for skipped in &dispatch.filtered {
            warn!(device = %skipped.device_id, reason = %skipped.reason, "device skipped");
        }
        dispatch.run_ids()
    };

    let mut all_completed = true;
    for run_id in run_ids {
        let status = gateway.wait(run_id).await?;
        all_completed &= status == RunStatus::Completed;
        let snapshot = gateway.status(run_id)?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(all_completed)
}

/// Wire the production collaborators from a validated config.
pub fn build_gateway(cfg: ConfigFile) -> Result<Gateway> {
    let ConfigFile {
        policy,
        devices,
        catalog,
    } = cfg;
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);

    let store: Arc<dyn RunStore> = match &policy.store_dir {
        Some(dir) => {
            debug!(dir = %dir.display(), "using file run store");
            Arc::new(FileRunStore::open(Arc::clone(&fs), dir.clone())?)
        }
        None => Arc::new(MemoryRunStore::new()),
    };
    let ledger = RunLedger::new(store, LogHub::new());
    let flags = CancelFlags::new(fs, policy.flag_dir.clone(), policy.cancel_flag_ttl);

    Ok(Gateway::with_step_executor(GatewayParts {
        catalog,
        devices: Arc::new(StaticDeviceRegistry::new(devices)),
        ledger,
        registry: RunRegistry::new(),
        flags,
        policy,
    }))
}

/// Dry-run output: the orchestration's steps, the devices and the policy.
fn print_dry_run(cfg: &ConfigFile, args: &CliArgs) {
    println!("droidflow dry-run");
    let policy = &cfg.policy;
    println!("  policy.stop_grace = {:?}", policy.stop_grace);
    println!("  policy.terminate_grace = {:?}", policy.terminate_grace);
    println!("  policy.flag_dir = {}", policy.flag_dir.display());
    if let Some(dir) = &policy.store_dir {
        println!("  policy.store_dir = {}", dir.display());
    }
    println!();

    match cfg.catalog.orchestration(&args.orchestration) {
        Some(def) => {
            println!("orchestration {} ({:?}):", def.name, def.status);
            for step in def.steps() {
                println!(
                    "  {}. {} ({} {}) timeout {:?}",
                    step.order,
                    step.script.name,
                    step.script.interpreter.display(),
                    step.script.script_path.display(),
                    step.timeout
                );
            }
        }
        None => println!("orchestration {} is not defined", args.orchestration),
    }

    println!("devices ({}):", cfg.devices.len());
    for device in &cfg.devices {
        let selected = args.devices.is_empty() || args.devices.contains(&device.id);
        println!(
            "  {} {} connection={} online={} active={}",
            if selected { "*" } else { "-" },
            device.id,
            device.connection,
            device.online,
            device.active
        );
    }

    debug!("dry-run complete (no execution)");
}
