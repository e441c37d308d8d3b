// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::catalog::Catalog;
use crate::devices::DeviceEntry;
use crate::types::DefinitionStatus;

use super::policy::ExecutionPolicy;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [policy]
/// stop_grace = "8s"
/// flag_dir = ".droidflow/flags"
///
/// [device.pixel-7]
/// connection = "192.168.1.20:5555"
///
/// [script.login]
/// interpreter = "python3"
/// path = "scripts/login.py"
///
/// [orchestration.morning]
/// status = "active"
/// steps = [
///   { order = 1, script = "login", timeout = "60s" },
/// ]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub policy: PolicySection,

    /// Keys are device ids.
    #[serde(default)]
    pub device: BTreeMap<String, DeviceConfig>,

    /// Keys are script names referenced by steps.
    #[serde(default)]
    pub script: BTreeMap<String, ScriptConfig>,

    #[serde(default)]
    pub orchestration: BTreeMap<String, OrchestrationConfig>,
}

/// A duration written either as a string with unit or as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

/// `[policy]` section. Missing keys take the defaults from
/// [`ExecutionPolicy::default`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySection {
    pub min_step_timeout: Option<DurationValue>,
    pub stop_grace: Option<DurationValue>,
    pub terminate_grace: Option<DurationValue>,
    pub cancel_flag_ttl: Option<DurationValue>,
    pub output_drain_timeout: Option<DurationValue>,
    pub fallback_interpreters: Option<Vec<String>>,
    pub flag_dir: Option<String>,
    pub store_dir: Option<String>,
}

/// `[device.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Serial or `host:port`; defaults to the device id.
    pub connection: Option<String>,
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    pub name: Option<String>,
}

fn default_true() -> bool {
    true
}

/// `[script.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub interpreter: String,
    pub path: String,
    pub working_dir: Option<String>,
}

/// `[orchestration.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub status: DefinitionStatus,
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    pub order: u32,
    pub script: String,
    pub timeout: DurationValue,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub policy: ExecutionPolicy,
    pub devices: Vec<DeviceEntry>,
    pub catalog: Catalog,
}
