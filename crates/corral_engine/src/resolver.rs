//! Pure translation between requested storage/devices and container attachments.

use crate::config::{GpuConfig, GpuPolicy};
use corral_core::{constants::mounts::EXTRA_PREFIX, prelude::*};

use std::collections::{BTreeMap, HashSet};

/// The storage-related parts of an install or stack request.
#[derive(Debug, Clone, Copy)]
pub struct MountRequest<'a> {
    pub bind_mounts: &'a BTreeMap<String, String>,
    pub volume_storages: &'a BTreeMap<String, String>,
    pub extra_mounts: &'a [ExtraMount],
}

impl<'a> MountRequest<'a> {
    pub fn from_install(req: &'a InstallRequest) -> Self {
        Self {
            bind_mounts: &req.bind_mounts,
            volume_storages: &req.volume_storages,
            extra_mounts: &req.extra_mounts,
        }
    }

    pub fn from_stack(req: &'a StackCreateRequest) -> Self {
        Self {
            bind_mounts: &req.bind_mounts,
            volume_storages: &req.volume_storages,
            extra_mounts: &req.extra_mounts,
        }
    }
}

struct MountBuilder<'a> {
    req: MountRequest<'a>,
    primary_storage: &'a str,
    points: Vec<MountPoint>,
    seen_paths: HashSet<String>,
}

impl<'a> MountBuilder<'a> {
    fn new(req: MountRequest<'a>, primary_storage: &'a str) -> Self {
        Self {
            req,
            primary_storage,
            points: Vec::new(),
            seen_paths: HashSet::new(),
        }
    }

    fn next_index(&self) -> u32 {
        self.points.len() as u32
    }

    /// Returns `false` if the mount path was already taken.
    fn declared(&mut self, name: String, vol: &VolumeSpec) -> bool {
        if !self.seen_paths.insert(vol.mount_path.clone()) {
            return false;
        }
        let index = self.next_index();
        let bind_override = self
            .req
            .bind_mounts
            .get(&name)
            .filter(|hp| !hp.is_empty())
            .cloned();

        let point = match vol.kind {
            MountKind::Volume => match bind_override {
                Some(host_path) => MountPoint {
                    index,
                    name,
                    kind: MountKind::Bind,
                    mount_path: vol.mount_path.clone(),
                    size_gb: None,
                    volume_id: None,
                    host_path: Some(host_path),
                    storage: None,
                    read_only: vol.read_only,
                },
                None => {
                    let storage = self
                        .req
                        .volume_storages
                        .get(&name)
                        .filter(|s| !s.is_empty() && s.as_str() != self.primary_storage)
                        .cloned();
                    MountPoint {
                        index,
                        name,
                        kind: MountKind::Volume,
                        mount_path: vol.mount_path.clone(),
                        size_gb: Some(vol.size_gb),
                        volume_id: None,
                        host_path: None,
                        storage,
                        read_only: vol.read_only,
                    }
                }
            },
            MountKind::Bind => {
                // An explicit empty value clears the manifest default.
                let host_path = match self.req.bind_mounts.get(&name) {
                    Some(hp) => hp.clone(),
                    None => vol.default_host_path.clone().unwrap_or_default(),
                };
                if host_path.is_empty() && !vol.required {
                    self.seen_paths.remove(&vol.mount_path);
                    return true;
                }
                MountPoint {
                    index,
                    name,
                    kind: MountKind::Bind,
                    mount_path: vol.mount_path.clone(),
                    size_gb: None,
                    volume_id: None,
                    host_path: Some(host_path),
                    storage: None,
                    read_only: vol.read_only,
                }
            }
        };
        self.points.push(point);
        true
    }

    fn extras(&mut self) {
        for extra in self.req.extra_mounts {
            if extra.host_path.is_empty() || extra.mount_path.is_empty() {
                continue;
            }
            let index = self.next_index();
            self.points.push(MountPoint {
                index,
                name: format!("{EXTRA_PREFIX}{index}"),
                kind: MountKind::Bind,
                mount_path: extra.mount_path.clone(),
                size_gb: None,
                volume_id: None,
                host_path: Some(extra.host_path.clone()),
                storage: None,
                read_only: extra.read_only,
            });
        }
    }
}

/// Mount points of a single-app install.
pub fn install_mounts(
    manifest: &AppManifest,
    req: MountRequest<'_>,
    primary_storage: &str,
) -> Vec<MountPoint> {
    let mut builder = MountBuilder::new(req, primary_storage);
    for vol in &manifest.volumes {
        builder.declared(vol.name.clone(), vol);
    }
    builder.extras();
    builder.points
}

/// Mount points of a stack. Volumes are named `<app id>-<volume>` and the first app
/// declaring a mount path wins. Returns the points and a warning per skipped duplicate.
pub fn stack_mounts(
    manifests: &[AppManifest],
    req: MountRequest<'_>,
    primary_storage: &str,
) -> (Vec<MountPoint>, Vec<String>) {
    let mut builder = MountBuilder::new(req, primary_storage);
    let mut warnings = Vec::new();
    for manifest in manifests {
        for vol in &manifest.volumes {
            let name = format!("{}-{}", manifest.id, vol.name);
            if !builder.declared(name, vol) {
                warnings.push(format!(
                    "mount path {} of {} is already used by another app; first wins",
                    vol.mount_path, manifest.id
                ));
            }
        }
    }
    builder.extras();
    (builder.points, warnings)
}

/// The storage request that reproduces `points` when fed back into the forward mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPartition {
    pub bind_mounts: BTreeMap<String, String>,
    pub volume_storages: BTreeMap<String, String>,
    pub extra_mounts: Vec<ExtraMount>,
}

pub fn partition_mounts(points: &[MountPoint], primary_storage: &str) -> MountPartition {
    let mut partition = MountPartition::default();
    for mp in points {
        match mp.kind {
            MountKind::Bind => {
                let Some(host_path) = mp.host_path.as_ref().filter(|hp| !hp.is_empty()) else {
                    continue;
                };
                if mp.is_extra() {
                    partition.extra_mounts.push(ExtraMount {
                        host_path: host_path.clone(),
                        mount_path: mp.mount_path.clone(),
                        read_only: mp.read_only,
                    });
                } else {
                    partition
                        .bind_mounts
                        .insert(mp.name.clone(), host_path.clone());
                }
            }
            MountKind::Volume => {
                if let Some(storage) = mp
                    .storage
                    .as_ref()
                    .filter(|s| !s.is_empty() && s.as_str() != primary_storage)
                {
                    partition
                        .volume_storages
                        .insert(mp.name.clone(), storage.clone());
                }
            }
        }
    }
    partition
}

/// Known GPU device profiles.
pub fn gpu_profile(name: &str) -> Option<Vec<DevicePassthrough>> {
    let dev = |path: &str, gid: Option<u32>| DevicePassthrough {
        path: path.to_string(),
        gid,
        mode: Some("0666".to_string()),
    };
    match name {
        "dri-render" => Some(vec![dev("/dev/dri/renderD128", Some(44))]),
        "nvidia-basic" => Some(vec![
            dev("/dev/nvidia0", None),
            dev("/dev/nvidiactl", None),
            dev("/dev/nvidia-uvm", None),
        ]),
        _ => None,
    }
}

/// Device inputs of one app.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRequest<'a> {
    pub explicit: &'a [DevicePassthrough],
    /// Profile named by the caller. Must exist.
    pub profile: Option<&'a str>,
    pub gpu: &'a GpuSpec,
}

/// Builds the passthrough list for one or more apps sharing a container.
///
/// `host_has` reports whether a device node exists on the host.
pub fn resolve_devices(
    requests: &[DeviceRequest<'_>],
    config: &GpuConfig,
    host_has: impl Fn(&str) -> bool,
) -> Result<Vec<DevicePassthrough>, String> {
    fn push(dev: DevicePassthrough, devices: &mut Vec<DevicePassthrough>) {
        if !devices.iter().any(|d| d.path == dev.path) {
            devices.push(dev);
        }
    }

    let mut devices: Vec<DevicePassthrough> = Vec::new();

    for req in requests {
        for dev in req.explicit {
            push(dev.clone(), &mut devices);
        }

        if config.policy == GpuPolicy::None {
            if req.gpu.required {
                return Err("app requires a GPU but GPU passthrough is disabled".to_string());
            }
            continue;
        }

        let profile = match req.profile {
            Some(name) => Some((
                name,
                gpu_profile(name).ok_or_else(|| format!("unknown GPU profile {name:?}"))?,
            )),
            None => req
                .gpu
                .profiles
                .iter()
                .find_map(|name| gpu_profile(name).map(|devs| (name.as_str(), devs))),
        };

        let Some((name, profile_devices)) = profile else {
            if req.gpu.required {
                return Err("app requires a GPU but declares no known profile".to_string());
            }
            continue;
        };

        for dev in profile_devices {
            if host_has(&dev.path) {
                push(dev, &mut devices);
            } else if req.gpu.required {
                return Err(format!(
                    "GPU profile {name} requires {} which is not present on the host",
                    dev.path
                ));
            }
        }
    }

    if config.policy == GpuPolicy::Allowlist {
        devices.retain(|d| config.allowed_devices.iter().any(|a| a == &d.path));
    }
    Ok(devices)
}
