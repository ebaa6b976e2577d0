use crate::{entity::MountKind, error::EngineError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The declarative description of an installable application, as served by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppManifest {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub categories: Vec<String>,
    pub lxc: LxcConfig,
    pub inputs: Vec<InputSpec>,
    pub provisioning: ProvisioningSpec,
    pub permissions: PermissionsSpec,
    pub outputs: Vec<OutputSpec>,
    pub gpu: GpuSpec,
    pub volumes: Vec<VolumeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LxcConfig {
    pub ostemplate: String,
    pub defaults: LxcDefaults,
    /// Raw runtime config lines appended after creation.
    pub extra_config: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LxcDefaults {
    pub unprivileged: bool,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub features: Vec<String>,
    pub onboot: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Secret,
    Select,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct InputSpec {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: InputType,
    pub default: Option<serde_json::Value>,
    pub required: bool,
    /// Can be changed in place by a reconfigure.
    pub reconfigurable: bool,
    pub validation: Option<InputValidation>,
}

impl InputSpec {
    /// The default rendered the way inputs are stored: strings verbatim, everything else as JSON text.
    pub fn default_string(&self) -> Option<String> {
        match self.default.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct InputValidation {
    /// Carried for catalog clients; the engine does not evaluate patterns.
    pub regex: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    #[serde(rename = "enum")]
    pub enum_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ProvisioningSpec {
    /// Path of the python provisioning script, relative to the app directory.
    pub script: String,
    pub env: BTreeMap<String, String>,
    pub timeout_sec: Option<u64>,
}

/// Operations the app may perform while provisioning. Enforced inside the container.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PermissionsSpec {
    pub packages: Vec<String>,
    pub pip: Vec<String>,
    pub urls: Vec<String>,
    pub paths: Vec<String>,
    pub services: Vec<String>,
    pub users: Vec<String>,
    pub commands: Vec<String>,
    pub installer_scripts: Vec<String>,
    pub apt_repos: Vec<String>,
}

impl PermissionsSpec {
    /// Union of two permission sets, keeping first-seen order.
    pub fn merge(&mut self, other: &PermissionsSpec) {
        fn union(into: &mut Vec<String>, from: &[String]) {
            for v in from {
                if !into.contains(v) {
                    into.push(v.clone());
                }
            }
        }
        union(&mut self.packages, &other.packages);
        union(&mut self.pip, &other.pip);
        union(&mut self.urls, &other.urls);
        union(&mut self.paths, &other.paths);
        union(&mut self.services, &other.services);
        union(&mut self.users, &other.users);
        union(&mut self.commands, &other.commands);
        union(&mut self.installer_scripts, &other.installer_scripts);
        union(&mut self.apt_repos, &other.apt_repos);
    }
}

/// A value shown to the user after install, e.g. `http://{{ip}}:{{http_port}}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OutputSpec {
    pub key: String,
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct GpuSpec {
    pub required: bool,
    /// Device profile names, in order of preference.
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MountKind,
    pub mount_path: String,
    pub size_gb: u32,
    pub label: String,
    /// Suggested host directory for binds.
    pub default_host_path: Option<String>,
    pub required: bool,
    pub read_only: bool,
}

impl AppManifest {
    pub fn input(&self, key: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.key == key)
    }

    /// Fills every input the caller left out with the manifest default.
    pub fn with_default_inputs(&self, inputs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = inputs.clone();
        for spec in &self.inputs {
            if merged.contains_key(&spec.key) {
                continue;
            }
            if let Some(default) = spec.default_string() {
                merged.insert(spec.key.clone(), default);
            }
        }
        merged
    }

    /// Checks required fields and value ranges.
    pub fn validate(&self) -> Result<(), EngineError> {
        let id = &self.id;
        let fail = |msg: String| Err(EngineError::InvalidRequest(format!("manifest {id}: {msg}")));

        if id.is_empty() {
            return Err(EngineError::invalid("manifest: id is required"));
        }
        if !is_kebab_case(id) {
            return fail("id must be kebab-case".into());
        }
        if self.name.is_empty() {
            return fail("name is required".into());
        }
        if self.description.is_empty() {
            return fail("description is required".into());
        }
        if self.version.is_empty() {
            return fail("version is required".into());
        }
        if self.categories.is_empty() {
            return fail("at least one category is required".into());
        }

        let lxc = &self.lxc;
        if lxc.ostemplate.is_empty() {
            return fail("lxc.ostemplate is required".into());
        }
        if lxc.defaults.cores < 1 {
            return fail("lxc.defaults.cores must be >= 1".into());
        }
        if lxc.defaults.memory_mb < 128 {
            return fail("lxc.defaults.memory_mb must be >= 128".into());
        }
        if lxc.defaults.disk_gb < 1 {
            return fail("lxc.defaults.disk_gb must be >= 1".into());
        }

        for input in &self.inputs {
            if input.key.is_empty() {
                return fail("input key is required".into());
            }
            if input.label.is_empty() {
                return fail(format!("input {} label is required", input.key));
            }
        }

        for vol in &self.volumes {
            if vol.name.is_empty() {
                return fail("volume name is required".into());
            }
            if !vol.mount_path.starts_with('/') {
                return fail(format!(
                    "volume {} mount_path must be an absolute path",
                    vol.name
                ));
            }
            if vol.kind == MountKind::Volume && vol.size_gb < 1 {
                return fail(format!("volume {} size_gb must be >= 1", vol.name));
            }
        }

        if self.provisioning.script.is_empty() {
            return fail("provisioning.script is required".into());
        }
        if !self.provisioning.script.ends_with(".py") {
            return fail(format!(
                "provisioning.script must be a .py file, got {:?}",
                self.provisioning.script
            ));
        }

        Ok(())
    }
}

fn is_kebab_case(s: &str) -> bool {
    !s.is_empty()
        && s.split('-').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
}

/// Whether `candidate` is a newer release than `current`.
///
/// Compares `major.minor.patch` numerically, ignoring a leading `v` and any
/// pre-release or build suffix. Versions that do not parse fall back to inequality.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    match (parse_semver(candidate), parse_semver(current)) {
        (Some(a), Some(b)) => a > b,
        _ => candidate != current,
    }
}

fn parse_semver(v: &str) -> Option<(u64, u64, u64)> {
    let v = v.trim().trim_start_matches('v');
    let core = v.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}
