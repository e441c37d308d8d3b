// src/devices.rs

//! Device registry collaborator.
//!
//! Device records (connection strings, online state) are owned elsewhere;
//! the engine only asks the questions in [`DeviceRegistry`].

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{DroidflowError, Result};

pub trait DeviceRegistry: Send + Sync {
    fn is_online(&self, device_id: &str) -> bool;
    fn is_active(&self, device_id: &str) -> bool;
    /// Argument handed to scripts (serial or `host:port`).
    fn connection_identifier(&self, device_id: &str) -> Option<String>;
    /// Known device ids, in selection order.
    fn device_ids(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub id: String,
    pub name: Option<String>,
    pub connection: String,
    pub online: bool,
    pub active: bool,
}

impl DeviceEntry {
    /// An active, online device whose connection string equals its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            connection: id.clone(),
            id,
            name: None,
            online: true,
            active: true,
        }
    }
}

/// Registry backed by the `[device.*]` config sections. Online state can
/// be flipped at runtime by whatever watches the bridge.
#[derive(Debug, Default)]
pub struct StaticDeviceRegistry {
    devices: RwLock<BTreeMap<String, DeviceEntry>>,
}

impl StaticDeviceRegistry {
    pub fn new(entries: impl IntoIterator<Item = DeviceEntry>) -> Self {
        Self {
            devices: RwLock::new(entries.into_iter().map(|d| (d.id.clone(), d)).collect()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, DeviceEntry>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, DeviceEntry>> {
        self.devices.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_online(&self, device_id: &str, online: bool) -> Result<()> {
        let mut devices = self.write();
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| DroidflowError::NotFound(format!("device '{device_id}'")))?;
        entry.online = online;
        Ok(())
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceEntry> {
        self.read().get(device_id).cloned()
    }
}

impl DeviceRegistry for StaticDeviceRegistry {
    fn is_online(&self, device_id: &str) -> bool {
        self.read().get(device_id).is_some_and(|d| d.online)
    }

    fn is_active(&self, device_id: &str) -> bool {
        self.read().get(device_id).is_some_and(|d| d.active)
    }

    fn connection_identifier(&self, device_id: &str) -> Option<String> {
        self.read().get(device_id).map(|d| d.connection.clone())
    }

    fn device_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_devices_are_offline_and_inactive() {
        let registry = StaticDeviceRegistry::new([DeviceEntry::new("emulator-5554")]);
        assert!(registry.is_online("emulator-5554"));
        assert!(!registry.is_online("ghost"));
        assert!(!registry.is_active("ghost"));
        assert_eq!(registry.connection_identifier("ghost"), None);
    }

    #[test]
    fn online_state_can_change() {
        let registry = StaticDeviceRegistry::new([DeviceEntry::new("a")]);
        registry.set_online("a", false).unwrap();
        assert!(!registry.is_online("a"));
        assert!(registry.set_online("b", true).is_err());
    }
}
