//! Admission checks for caller-supplied values.

use corral_core::prelude::*;

use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};

/// Host paths that are never bind-mounted into a container.
const DENIED_BIND_PATHS: &[&str] = &[
    "/etc",
    "/proc",
    "/sys",
    "/dev",
    "/root",
    "/boot",
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib64",
    "/var/lib/pve-appstore",
    "/etc/pve",
    "/etc/pve-appstore",
];

const RESERVED_ENV_KEYS: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "PYTHONPATH",
    "PYTHONUNBUFFERED",
    "HOME",
    "USER",
    "SHELL",
    "TERM",
];

const ALLOWED_CONFIG_PREFIXES: &[&str] = &[
    "lxc.cgroup2.devices.allow",
    "lxc.cgroup.devices.allow",
    "lxc.mount.entry",
    "lxc.mount.auto",
    "lxc.environment",
];

fn invalid<T>(message: String) -> Result<T> {
    Err(EngineError::InvalidRequest(message))
}

/// Lexically normalizes `path`, resolving `.` and `..` without touching the filesystem.
fn clean_path(path: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn bind_path(host_path: &str) -> Result<()> {
    if host_path.is_empty() {
        return Ok(());
    }
    let cleaned = clean_path(host_path);
    if !cleaned.is_absolute() {
        return invalid(format!("bind mount path must be absolute: {host_path:?}"));
    }
    if DENIED_BIND_PATHS
        .iter()
        .any(|denied| cleaned.starts_with(denied))
    {
        return invalid(format!(
            "bind mount path {host_path:?} is not allowed (restricted system path)"
        ));
    }
    Ok(())
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn is_allowed_device(path: &str) -> bool {
    if let Some(rest) = path.strip_prefix("/dev/dri/") {
        let n = rest
            .strip_prefix("card")
            .or_else(|| rest.strip_prefix("renderD"))
            .or_else(|| rest.strip_prefix("render"));
        return n.is_some_and(is_digits);
    }
    if let Some(rest) = path.strip_prefix("/dev/nvidia") {
        return rest.is_empty()
            || is_digits(rest)
            || matches!(rest, "-uvm" | "-uvm-tools" | "ctl");
    }
    path == "/dev/net/tun"
}

pub fn devices(devices: &[DevicePassthrough]) -> Result<()> {
    for dev in devices {
        if !is_allowed_device(&dev.path) {
            return invalid(format!(
                "device path {:?} is not in the allowed list (only GPU and TUN devices permitted)",
                dev.path
            ));
        }
        if let Some(mode) = dev.mode.as_deref().filter(|m| !m.is_empty()) {
            let octal = mode.len() == 4
                && mode.starts_with('0')
                && mode.chars().skip(1).all(|c| ('0'..='7').contains(&c));
            if !octal {
                return invalid(format!(
                    "device mode {mode:?} is invalid (must be octal like 0666)"
                ));
            }
        }
    }
    Ok(())
}

pub fn env_vars(vars: &BTreeMap<String, String>) -> Result<()> {
    for key in vars.keys() {
        let mut chars = key.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return invalid(format!(
                "environment variable key {key:?} is invalid (must match [A-Za-z_][A-Za-z0-9_]*)"
            ));
        }
        if RESERVED_ENV_KEYS.contains(&key.to_ascii_uppercase().as_str()) {
            return invalid(format!(
                "environment variable {key:?} is reserved and cannot be overridden"
            ));
        }
    }
    Ok(())
}

/// Raw runtime config lines may only touch device and mount keys.
pub fn extra_config(lines: &[String]) -> Result<()> {
    for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
        if line.starts_with('-') {
            return invalid(format!("invalid extra config line {line:?}: must not start with '-'"));
        }
        let Some(split) = line.find(['=', ':']) else {
            return invalid(format!(
                "invalid extra config line {line:?}: must be key=value or key: value"
            ));
        };
        let key = line[..split].trim();
        let allowed = ALLOWED_CONFIG_PREFIXES.iter().any(|prefix| {
            key == *prefix
                || key
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
        });
        if !allowed {
            return invalid(format!("config key {key:?} is not in the allowed list"));
        }
    }
    Ok(())
}

pub fn hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Ok(());
    }
    let valid = hostname.len() <= 63
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !hostname.starts_with('-')
        && !hostname.ends_with('-');
    if !valid {
        return invalid(format!(
            "invalid hostname {hostname:?} (must be alphanumeric with hyphens, max 63 chars)"
        ));
    }
    Ok(())
}

pub fn bridge(bridge: &str) -> Result<()> {
    if bridge.is_empty() {
        return Ok(());
    }
    match bridge.strip_prefix("vmbr") {
        Some(n) if is_digits(n) => Ok(()),
        _ => invalid(format!("invalid bridge name {bridge:?} (must match vmbr[0-9]+)")),
    }
}

pub fn ip_address(ip: &str) -> Result<()> {
    if ip.is_empty() || ip == "dhcp" {
        return Ok(());
    }
    let (addr, prefix) = match ip.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (ip, None),
    };
    let octets: Vec<&str> = addr.split('.').collect();
    let valid = octets.len() == 4
        && octets.iter().all(|o| o.len() <= 3 && is_digits(o))
        && prefix.is_none_or(|p| p.len() <= 2 && is_digits(p));
    if !valid {
        return invalid(format!("invalid IP address {ip:?}"));
    }
    Ok(())
}

pub fn tags(tags: &str) -> Result<()> {
    if tags.is_empty() {
        return Ok(());
    }
    if !tags
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ';'))
    {
        return invalid(format!(
            "invalid tags {tags:?} (must be alphanumeric with hyphens/underscores/semicolons)"
        ));
    }
    Ok(())
}

pub fn resources(cores: Option<u32>, memory_mb: Option<u32>, disk_gb: Option<u32>) -> Result<()> {
    if cores.is_some_and(|c| c < 1) {
        return invalid("cores must be >= 1".to_string());
    }
    if memory_mb.is_some_and(|m| m < 128) {
        return invalid("memory_mb must be >= 128".to_string());
    }
    if disk_gb.is_some_and(|d| d < 1) {
        return invalid("disk_gb must be >= 1".to_string());
    }
    Ok(())
}

pub fn extra_mounts(mounts: &[ExtraMount]) -> Result<()> {
    for m in mounts {
        bind_path(&m.host_path)?;
        if !m.mount_path.is_empty() && !m.mount_path.starts_with('/') {
            return invalid(format!(
                "extra mount path {:?} must be absolute",
                m.mount_path
            ));
        }
    }
    Ok(())
}

/// Checks supplied input values against the manifest's input schema.
pub fn inputs(manifest: &AppManifest, inputs: &BTreeMap<String, String>) -> Result<()> {
    for spec in &manifest.inputs {
        let value = inputs.get(&spec.key).filter(|v| !v.is_empty());
        let Some(value) = value else {
            if spec.required {
                return invalid(format!("input {:?} is required", spec.key));
            }
            continue;
        };
        let Some(rules) = &spec.validation else {
            continue;
        };

        match spec.kind {
            InputType::Number => {
                let Ok(num) = value.parse::<f64>() else {
                    return invalid(format!("input {:?}: invalid number {value:?}", spec.key));
                };
                if let Some(min) = rules.min.filter(|min| num < *min) {
                    return invalid(format!(
                        "input {:?}: value {num} is below minimum {min}",
                        spec.key
                    ));
                }
                if let Some(max) = rules.max.filter(|max| num > *max) {
                    return invalid(format!(
                        "input {:?}: value {num} exceeds maximum {max}",
                        spec.key
                    ));
                }
            }
            InputType::String | InputType::Secret => {
                let len = value.chars().count();
                if let Some(min) = rules.min_length.filter(|min| len < *min) {
                    return invalid(format!(
                        "input {:?}: must be at least {min} characters (got {len})",
                        spec.key
                    ));
                }
                if let Some(max) = rules.max_length.filter(|max| len > *max) {
                    return invalid(format!(
                        "input {:?}: must be at most {max} characters (got {len})",
                        spec.key
                    ));
                }
            }
            InputType::Boolean | InputType::Select => {}
        }

        if !rules.enum_values.is_empty() && !rules.enum_values.contains(value) {
            return invalid(format!(
                "input {:?}: value {value:?} is not one of the allowed options",
                spec.key
            ));
        }
    }
    Ok(())
}
