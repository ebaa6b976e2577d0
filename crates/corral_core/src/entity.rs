use crate::constants::mounts::EXTRA_PREFIX;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Running,
    Stopped,
    Uninstalled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    #[default]
    Volume,
    Bind,
}

/// A storage attachment of a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountPoint {
    /// Slot number (`mp0`, `mp1`, ...).
    pub index: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MountKind,
    pub mount_path: String,
    /// Volume size, volumes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<u32>,
    /// Runtime volume identifier, read back after the container was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    /// Host directory, binds only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    /// Storage override, volumes only. [`None`] means the container's primary storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl MountPoint {
    pub fn is_volume(&self) -> bool {
        self.kind == MountKind::Volume
    }

    /// User-added bind mount that no manifest declares.
    pub fn is_extra(&self) -> bool {
        self.kind == MountKind::Bind && self.name.starts_with(EXTRA_PREFIX)
    }
}

/// A host device node exposed inside the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevicePassthrough {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Octal permission string, e.g. `0666`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl DevicePassthrough {
    pub fn is_nvidia(&self) -> bool {
        self.path.contains("nvidia")
    }
}

/// A provisioned application container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Install {
    pub id: String,
    pub app_id: String,
    pub app_name: String,
    pub app_version: String,
    /// [`None`] once the container was destroyed with volumes kept.
    pub ctid: Option<u32>,
    pub status: InstallStatus,
    pub storage: String,
    pub bridge: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub hostname: String,
    /// Static address in CIDR notation, [`None`] for DHCP.
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub onboot: bool,
    pub unprivileged: bool,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub mount_points: Vec<MountPoint>,
    #[serde(default)]
    pub devices: Vec<DevicePassthrough>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Install {
    pub fn is_uninstalled(&self) -> bool {
        self.status == InstallStatus::Uninstalled
    }

    pub fn has_managed_volumes(&self) -> bool {
        self.mount_points.iter().any(MountPoint::is_volume)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StackAppStatus {
    #[default]
    Pending,
    Provisioning,
    Completed,
    Failed,
}

/// One application provisioned inside a stack container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackApp {
    pub app_id: String,
    pub app_name: String,
    pub app_version: String,
    pub order: u32,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub status: StackAppStatus,
    pub error: Option<String>,
}

/// Several applications co-located in one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stack {
    pub id: String,
    pub name: String,
    pub ctid: Option<u32>,
    pub status: InstallStatus,
    pub os_template: String,
    pub storage: String,
    pub bridge: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub onboot: bool,
    pub unprivileged: bool,
    pub apps: Vec<StackApp>,
    #[serde(default)]
    pub mount_points: Vec<MountPoint>,
    #[serde(default)]
    pub devices: Vec<DevicePassthrough>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Live resource snapshot reported by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerStatusDetail {
    pub state: ContainerState,
    pub uptime_secs: u64,
    /// CPU usage as a fraction of `cpus`.
    pub cpu: f64,
    pub cpus: u32,
    pub mem_bytes: u64,
    pub max_mem_bytes: u64,
    pub disk_bytes: u64,
    pub max_disk_bytes: u64,
    pub net_in_bytes: u64,
    pub net_out_bytes: u64,
}

/// A record decorated with best-effort live information.
///
/// Every live field is optional: a failed runtime query leaves it empty instead of failing the listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Enriched<T> {
    #[serde(flatten)]
    pub record: T,
    pub live: Option<ContainerStatusDetail>,
    pub ip: Option<String>,
    pub uptime_secs: Option<u64>,
    pub catalog_version: Option<String>,
    #[serde(default)]
    pub update_available: bool,
}

impl<T> Enriched<T> {
    pub fn bare(record: T) -> Self {
        Self {
            record,
            live: None,
            ip: None,
            uptime_secs: None,
            catalog_version: None,
            update_available: false,
        }
    }
}

pub type InstallDetail = Enriched<Install>;
pub type StackDetail = Enriched<Stack>;
