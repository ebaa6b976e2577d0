use corral_core::prelude::*;

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Storages containers may be placed on. The first one is the default.
    pub storages: Vec<String>,
    /// Network bridges containers may attach to. The first one is the default.
    pub bridges: Vec<String>,
    pub defaults: ResourceDefaults,
    /// Upper bound of jobs executing at the same time. Further jobs wait as `queued`.
    ///
    /// Defaults to `4`.
    pub max_concurrent_jobs: usize,
    pub gpu: GpuConfig,
    /// Packages installed into every new container before provisioning.
    pub base_packages: Vec<String>,
    /// Attempts made to destroy a container before giving up.
    ///
    /// Defaults to `5`.
    pub destroy_attempts: u32,
    pub destroy_retry_delay_ms: u64,
    /// Polls for an IP address after start. Running out is not an error.
    pub network_wait_attempts: u32,
    pub network_wait_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    /// Pause between stop and start of a restart.
    pub restart_delay_ms: u64,
    /// Pause after destroying a container that is about to be recreated.
    pub recreate_settle_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storages: vec!["local-lvm".to_string()],
            bridges: vec!["vmbr0".to_string()],
            defaults: ResourceDefaults::default(),
            max_concurrent_jobs: 4,
            gpu: GpuConfig::default(),
            base_packages: Vec::new(),
            destroy_attempts: 5,
            destroy_retry_delay_ms: 5_000,
            network_wait_attempts: 30,
            network_wait_interval_ms: 2_000,
            shutdown_timeout_secs: 30,
            restart_delay_ms: 2_000,
            recreate_settle_ms: 3_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceDefaults {
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cores: 2,
            memory_mb: 2048,
            disk_gb: 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuPolicy {
    /// GPU profiles are never applied.
    None,
    /// Any known profile may be applied.
    #[default]
    Allow,
    /// Only devices listed in [`GpuConfig::allowed_devices`] are passed through.
    Allowlist,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GpuConfig {
    pub policy: GpuPolicy,
    pub allowed_devices: Vec<String>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.storages.is_empty() {
            return Err(EngineError::invalid("config: at least one storage is required"));
        }
        if self.bridges.is_empty() {
            return Err(EngineError::invalid("config: at least one bridge is required"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(EngineError::invalid(
                "config: max_concurrent_jobs must be >= 1",
            ));
        }
        if self.destroy_attempts == 0 {
            return Err(EngineError::invalid("config: destroy_attempts must be >= 1"));
        }
        if let Some(bad) = self.base_packages.iter().find(|p| !is_package_name(p)) {
            return Err(EngineError::invalid(format!(
                "config: invalid base package name {bad:?}"
            )));
        }
        let d = &self.defaults;
        if d.cores < 1 || d.memory_mb < 128 || d.disk_gb < 1 {
            return Err(EngineError::invalid(
                "config: defaults must be at least 1 core, 128 MB memory and 1 GB disk",
            ));
        }
        Ok(())
    }

    pub fn default_storage(&self) -> &str {
        self.storages.first().map(String::as_str).unwrap_or_default()
    }

    pub fn default_bridge(&self) -> &str {
        self.bridges.first().map(String::as_str).unwrap_or_default()
    }

    pub(crate) fn destroy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.destroy_retry_delay_ms)
    }

    pub(crate) fn network_wait_interval(&self) -> Duration {
        Duration::from_millis(self.network_wait_interval_ms)
    }

    pub(crate) fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub(crate) fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub(crate) fn recreate_settle(&self) -> Duration {
        Duration::from_millis(self.recreate_settle_ms)
    }
}

/// Debian package name charset. Names end up on a command line.
fn is_package_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c))
}
