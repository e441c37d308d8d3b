// src/config/validate.rs

use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::{Catalog, OrchestrationDefinition, ScriptDefinition, Step};
use crate::config::model::{ConfigFile, DurationValue, PolicySection, RawConfigFile};
use crate::config::policy::{parse_duration, ExecutionPolicy};
use crate::devices::DeviceEntry;
use crate::errors::{DroidflowError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::DroidflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_orchestrations(&raw)?;
        let policy = build_policy(&raw.policy)?;
        let catalog = build_catalog(&raw, &policy)?;
        let devices = build_devices(&raw)?;
        Ok(ConfigFile {
            policy,
            devices,
            catalog,
        })
    }
}

fn ensure_has_orchestrations(cfg: &RawConfigFile) -> Result<()> {
    if cfg.orchestration.is_empty() {
        return Err(DroidflowError::ConfigError(
            "config must contain at least one [orchestration.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn duration(value: &DurationValue, what: &str) -> Result<Duration> {
    match value {
        DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
        DurationValue::Text(text) => parse_duration(text)
            .map_err(|e| DroidflowError::ConfigError(format!("{what}: {e}"))),
    }
}

fn build_policy(section: &PolicySection) -> Result<ExecutionPolicy> {
    let mut policy = ExecutionPolicy::default();

    let fields: [(&Option<DurationValue>, &mut Duration, &str); 5] = [
        (&section.min_step_timeout, &mut policy.min_step_timeout, "[policy].min_step_timeout"),
        (&section.stop_grace, &mut policy.stop_grace, "[policy].stop_grace"),
        (&section.terminate_grace, &mut policy.terminate_grace, "[policy].terminate_grace"),
        (&section.cancel_flag_ttl, &mut policy.cancel_flag_ttl, "[policy].cancel_flag_ttl"),
        (
            &section.output_drain_timeout,
            &mut policy.output_drain_timeout,
            "[policy].output_drain_timeout",
        ),
    ];
    for (value, slot, what) in fields {
        if let Some(value) = value {
            *slot = duration(value, what)?;
        }
    }

    if policy.min_step_timeout.is_zero() {
        return Err(DroidflowError::ConfigError(
            "[policy].min_step_timeout must be greater than zero".to_string(),
        ));
    }
    if policy.terminate_grace.is_zero() {
        return Err(DroidflowError::ConfigError(
            "[policy].terminate_grace must be greater than zero".to_string(),
        ));
    }
    if policy.cancel_flag_ttl < policy.stop_grace {
        return Err(DroidflowError::ConfigError(format!(
            "[policy].cancel_flag_ttl ({:?}) must not be shorter than stop_grace ({:?})",
            policy.cancel_flag_ttl, policy.stop_grace
        )));
    }

    if let Some(list) = &section.fallback_interpreters {
        policy.fallback_interpreters = list.iter().map(PathBuf::from).collect();
    }
    if let Some(dir) = &section.flag_dir {
        policy.flag_dir = PathBuf::from(dir);
    }
    policy.store_dir = section.store_dir.as_ref().map(PathBuf::from);

    Ok(policy)
}

fn build_catalog(cfg: &RawConfigFile, policy: &ExecutionPolicy) -> Result<Catalog> {
    let mut catalog = Catalog::new();

    for (name, script) in &cfg.script {
        if script.interpreter.trim().is_empty() {
            return Err(DroidflowError::ConfigError(format!(
                "script '{name}' has an empty `interpreter`"
            )));
        }
        if script.path.trim().is_empty() {
            return Err(DroidflowError::ConfigError(format!(
                "script '{name}' has an empty `path`"
            )));
        }
        let mut def = ScriptDefinition::new(name, &script.interpreter, &script.path);
        def.working_dir = script.working_dir.as_ref().map(PathBuf::from);
        catalog.insert_script(def);
    }

    for (name, orch) in &cfg.orchestration {
        let mut steps = Vec::with_capacity(orch.steps.len());
        for step in &orch.steps {
            let script = catalog.script(&step.script).cloned().ok_or_else(|| {
                DroidflowError::ConfigError(format!(
                    "orchestration '{name}' step {} references unknown script '{}'",
                    step.order, step.script
                ))
            })?;
            let timeout = duration(
                &step.timeout,
                &format!("orchestration '{name}' step {} timeout", step.order),
            )?;
            if timeout < policy.min_step_timeout {
                return Err(DroidflowError::ConfigError(format!(
                    "orchestration '{name}' step {} timeout {:?} is below the minimum of {:?}",
                    step.order, timeout, policy.min_step_timeout
                )));
            }
            steps.push(Step {
                order: step.order,
                script,
                timeout,
            });
        }
        catalog.insert_orchestration(OrchestrationDefinition::new(name, orch.status, steps)?);
    }

    Ok(catalog)
}

fn build_devices(cfg: &RawConfigFile) -> Result<Vec<DeviceEntry>> {
    let mut devices = Vec::with_capacity(cfg.device.len());
    for (id, device) in &cfg.device {
        let connection = device.connection.clone().unwrap_or_else(|| id.clone());
        if connection.trim().is_empty() {
            return Err(DroidflowError::ConfigError(format!(
                "device '{id}' has an empty `connection`"
            )));
        }
        devices.push(DeviceEntry {
            id: id.clone(),
            name: device.name.clone(),
            connection,
            online: device.online,
            active: device.active,
        });
    }
    Ok(devices)
}
