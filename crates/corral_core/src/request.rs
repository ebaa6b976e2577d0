use crate::entity::DevicePassthrough;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A request to provision a new application container.
///
/// Everything except `app_id` is optional and resolved against the engine
/// configuration and the app manifest.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct InstallRequest {
    pub app_id: String,
    /// Primary storage. Defaults to the first configured storage.
    pub storage: Option<String>,
    /// Network bridge. Defaults to the first configured bridge.
    pub bridge: Option<String>,
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_gb: Option<u32>,
    /// Defaults to the app id.
    pub hostname: Option<String>,
    /// Static address in CIDR notation, or `dhcp`.
    pub ip_address: Option<String>,
    pub onboot: Option<bool>,
    pub unprivileged: Option<bool>,
    pub inputs: BTreeMap<String, String>,
    /// Explicit device passthrough, merged with any GPU profile devices.
    pub devices: Vec<DevicePassthrough>,
    pub env_vars: BTreeMap<String, String>,
    /// Manifest volume name -> host path. Turns a volume into a bind mount,
    /// or supplies the host path of a declared bind. An empty value clears the default.
    pub bind_mounts: BTreeMap<String, String>,
    /// Manifest volume name -> storage override.
    pub volume_storages: BTreeMap<String, String>,
    /// Ad hoc bind mounts not declared by the manifest.
    pub extra_mounts: Vec<ExtraMount>,
    /// Semicolon-separated tags added to the container.
    pub extra_tags: Option<String>,
    /// Explicit GPU profile. Otherwise the first profile the manifest declares is used.
    pub gpu_profile: Option<String>,
}

impl InstallRequest {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ExtraMount {
    pub host_path: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// Overrides applied when an install's container is recreated by reinstall or update.
///
/// Unset fields keep the value stored on the install.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ReinstallRequest {
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_gb: Option<u32>,
    pub bridge: Option<String>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub onboot: Option<bool>,
    pub unprivileged: Option<bool>,
    pub inputs: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,
}

pub type UpdateRequest = ReinstallRequest;

/// Changes applied by recreating the container of an install or stack.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EditRequest {
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    /// May grow but never shrink.
    pub disk_gb: Option<u32>,
    pub bridge: Option<String>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub onboot: Option<bool>,
    pub unprivileged: Option<bool>,
    /// Merged into the existing inputs. Ignored for stacks.
    pub inputs: BTreeMap<String, String>,
}

/// An in-place change that does not recreate the container.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ReconfigureRequest {
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StackAppRequest {
    pub app_id: String,
    pub inputs: BTreeMap<String, String>,
}

/// A request to provision several apps into one container.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StackCreateRequest {
    pub name: String,
    pub apps: Vec<StackAppRequest>,
    pub storage: Option<String>,
    pub bridge: Option<String>,
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_gb: Option<u32>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub onboot: Option<bool>,
    pub unprivileged: Option<bool>,
    pub devices: Vec<DevicePassthrough>,
    pub env_vars: BTreeMap<String, String>,
    /// Keys are `<app id>-<volume name>`.
    pub bind_mounts: BTreeMap<String, String>,
    pub volume_storages: BTreeMap<String, String>,
    pub extra_mounts: Vec<ExtraMount>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RecommendedResources {
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

/// Outcome of a dry-run stack validation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StackValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommended: RecommendedResources,
    pub os_template: Option<String>,
}
