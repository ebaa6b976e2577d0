//! Portable recipes that recreate an install or stack elsewhere.

use crate::resolver::{MountPartition, partition_mounts};
use corral_core::prelude::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A port the app listens on, derived from its inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipePort {
    pub key: String,
    pub label: String,
    pub value: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstallRecipe {
    pub app_id: String,
    pub storage: String,
    pub bridge: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub onboot: Option<bool>,
    pub unprivileged: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DevicePassthrough>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_vars: BTreeMap<String, String>,
    /// Informational; not consumed on import.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<RecipePort>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bind_mounts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_storages: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<ExtraMount>,
}

/// Inputs that look like listening ports: the key mentions "port", or the
/// declared numeric range lies within the unprivileged port range.
pub fn ports(manifest: &AppManifest, inputs: &BTreeMap<String, String>) -> Vec<RecipePort> {
    manifest
        .inputs
        .iter()
        .filter_map(|spec| {
            let value = inputs.get(&spec.key)?;
            let in_port_range = spec.validation.as_ref().is_some_and(|v| {
                v.min.is_some_and(|min| min >= 1024.0) && v.max.is_some_and(|max| max <= 65535.0)
            });
            if !spec.key.contains("port") && !in_port_range {
                return None;
            }
            let value = value.trim().parse::<u16>().ok().filter(|p| *p > 0)?;
            Some(RecipePort {
                key: spec.key.clone(),
                label: spec.label.clone(),
                value,
                protocol: "tcp".to_string(),
            })
        })
        .collect()
}

impl InstallRecipe {
    /// `manifest` is only used to derive ports and may be missing if the app left the catalog.
    pub fn from_install(install: &Install, manifest: Option<&AppManifest>) -> Self {
        let MountPartition {
            bind_mounts,
            volume_storages,
            extra_mounts,
        } = partition_mounts(&install.mount_points, &install.storage);
        Self {
            app_id: install.app_id.clone(),
            storage: install.storage.clone(),
            bridge: install.bridge.clone(),
            cores: install.cores,
            memory_mb: install.memory_mb,
            disk_gb: install.disk_gb,
            hostname: install.hostname.clone(),
            ip_address: install.ip_address.clone(),
            onboot: Some(install.onboot),
            unprivileged: Some(install.unprivileged),
            inputs: install.inputs.clone(),
            devices: install.devices.clone(),
            env_vars: install.env_vars.clone(),
            ports: manifest
                .map(|m| ports(m, &install.inputs))
                .unwrap_or_default(),
            bind_mounts,
            volume_storages,
            extra_mounts,
        }
    }

    pub fn into_request(self) -> InstallRequest {
        InstallRequest {
            app_id: self.app_id,
            storage: Some(self.storage).filter(|s| !s.is_empty()),
            bridge: Some(self.bridge).filter(|s| !s.is_empty()),
            cores: Some(self.cores).filter(|c| *c > 0),
            memory_mb: Some(self.memory_mb).filter(|m| *m > 0),
            disk_gb: Some(self.disk_gb).filter(|d| *d > 0),
            hostname: Some(self.hostname).filter(|h| !h.is_empty()),
            ip_address: self.ip_address,
            onboot: self.onboot,
            unprivileged: self.unprivileged,
            inputs: self.inputs,
            devices: self.devices,
            env_vars: self.env_vars,
            bind_mounts: self.bind_mounts,
            volume_storages: self.volume_storages,
            extra_mounts: self.extra_mounts,
            extra_tags: None,
            gpu_profile: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StackRecipeApp {
    pub app_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StackRecipe {
    pub name: String,
    pub apps: Vec<StackRecipeApp>,
    pub storage: String,
    pub bridge: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub onboot: Option<bool>,
    pub unprivileged: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DevicePassthrough>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bind_mounts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_storages: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<ExtraMount>,
}

impl StackRecipe {
    pub fn from_stack(stack: &Stack) -> Self {
        let MountPartition {
            bind_mounts,
            volume_storages,
            extra_mounts,
        } = partition_mounts(&stack.mount_points, &stack.storage);
        let mut apps: Vec<&StackApp> = stack.apps.iter().collect();
        apps.sort_by_key(|a| a.order);
        Self {
            name: stack.name.clone(),
            apps: apps
                .into_iter()
                .map(|a| StackRecipeApp {
                    app_id: a.app_id.clone(),
                    inputs: a.inputs.clone(),
                })
                .collect(),
            storage: stack.storage.clone(),
            bridge: stack.bridge.clone(),
            cores: stack.cores,
            memory_mb: stack.memory_mb,
            disk_gb: stack.disk_gb,
            hostname: stack.hostname.clone(),
            ip_address: stack.ip_address.clone(),
            onboot: Some(stack.onboot),
            unprivileged: Some(stack.unprivileged),
            devices: stack.devices.clone(),
            env_vars: stack.env_vars.clone(),
            bind_mounts,
            volume_storages,
            extra_mounts,
        }
    }

    pub fn into_request(self) -> StackCreateRequest {
        StackCreateRequest {
            name: self.name,
            apps: self
                .apps
                .into_iter()
                .map(|a| StackAppRequest {
                    app_id: a.app_id,
                    inputs: a.inputs,
                })
                .collect(),
            storage: Some(self.storage).filter(|s| !s.is_empty()),
            bridge: Some(self.bridge).filter(|s| !s.is_empty()),
            cores: Some(self.cores).filter(|c| *c > 0),
            memory_mb: Some(self.memory_mb).filter(|m| *m > 0),
            disk_gb: Some(self.disk_gb).filter(|d| *d > 0),
            hostname: Some(self.hostname).filter(|h| !h.is_empty()),
            ip_address: self.ip_address,
            onboot: self.onboot,
            unprivileged: self.unprivileged,
            devices: self.devices,
            env_vars: self.env_vars,
            bind_mounts: self.bind_mounts,
            volume_storages: self.volume_storages,
            extra_mounts: self.extra_mounts,
        }
    }
}

/// Every install and stack, ready to be applied on another host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportBundle {
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub installs: Vec<InstallRecipe>,
    #[serde(default)]
    pub stacks: Vec<StackRecipe>,
}

/// The job started for a recipe, or why it was rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyResult {
    /// App id or stack name.
    pub target: String,
    pub job_id: Option<String>,
    pub error: Option<String>,
}
