//! # Corral Runtime Mock
//!
//! An in-memory container runtime and a static catalog for development and testing.
//!
//! **WARNING**: Nothing is provisioned. Containers only exist inside the [`MockRuntime`] value.
//!
//! **DO NOT use this in production!!!**
//!
//! The runtime can be paused to hold jobs in flight, and individual operations
//! can be made to fail, which is what the engine test suites rely on.
//!
//! ## Usage
//!
//! ```rust
//! # use corral_runtime_mock::{MockRuntime, StaticCatalog, fixtures};
//! # fn main() {
//! let runtime = MockRuntime::new();
//! let catalog = StaticCatalog::new().with_app(fixtures::nginx());
//! # }
//! ```

pub mod fixtures;

use corral_core::prelude::*;

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lowest id handed out by [`MockRuntime::allocate_ctid`].
pub const FIRST_CTID: u32 = 100;

/// Runtime operations that can be made to fail with [`MockRuntime::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Allocate,
    Create,
    Start,
    Stop,
    Shutdown,
    Destroy,
    Detach,
    UpdateResources,
    ConfigureDevices,
    MountHostPath,
    AppendConfig,
    PushFile,
    Exec,
}

/// A container as the mock sees it.
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub options: CreateOptions,
    pub running: bool,
    pub cores: u32,
    pub memory_mb: u32,
    pub devices: Vec<DevicePassthrough>,
    /// Host directories mounted after creation.
    pub host_mounts: Vec<MountPoint>,
    pub config: Vec<String>,
    pub files: BTreeMap<String, Bytes>,
    pub detached: Vec<u32>,
}

struct MockState {
    containers: BTreeMap<u32, MockContainer>,
    destroyed: Vec<u32>,
    failures: HashMap<MockOp, String>,
    status_failures: HashSet<u32>,
    host_devices: Vec<String>,
    nvidia_library_path: Option<String>,
    exec_results: HashMap<String, ExecOutput>,
    provision_output: Vec<String>,
    provision_exit_code: i32,
    commands: Vec<(u32, Vec<String>)>,
}

#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(MockState {
                containers: BTreeMap::new(),
                destroyed: Vec::new(),
                failures: HashMap::new(),
                status_failures: HashSet::new(),
                host_devices: Vec::new(),
                nvidia_library_path: None,
                exec_results: HashMap::new(),
                provision_output: Vec::new(),
                provision_exit_code: 0,
                commands: Vec::new(),
            })),
            gate: Arc::new(gate),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Holds every cancellable operation until [`MockRuntime::resume`] is called.
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Makes every following call of `op` fail with [`RuntimeError::System`].
    pub fn fail(&self, op: MockOp, message: impl Into<String>) {
        self.state().failures.insert(op, message.into());
    }

    pub fn clear_failure(&self, op: MockOp) {
        self.state().failures.remove(&op);
    }

    /// Makes status queries of one container fail.
    pub fn fail_status(&self, ctid: u32) {
        self.state().status_failures.insert(ctid);
    }

    pub fn set_host_devices(&self, devices: impl IntoIterator<Item = impl Into<String>>) {
        self.state().host_devices = devices.into_iter().map(Into::into).collect();
    }

    pub fn set_nvidia_library_path(&self, path: impl Into<String>) {
        self.state().nvidia_library_path = Some(path.into());
    }

    /// Result of every buffered command whose space-joined argv equals `command`.
    ///
    /// Other commands succeed with no output.
    pub fn set_exec_result(&self, command: impl Into<String>, output: ExecOutput) {
        self.state().exec_results.insert(command.into(), output);
    }

    /// Lines printed by every streamed command, followed by `exit_code`.
    pub fn set_provision_output(
        &self,
        lines: impl IntoIterator<Item = impl Into<String>>,
        exit_code: i32,
    ) {
        let mut state = self.state();
        state.provision_output = lines.into_iter().map(Into::into).collect();
        state.provision_exit_code = exit_code;
    }

    /// Seeds a running container that was not created through the engine.
    pub fn insert_container(&self, options: CreateOptions) {
        let ctid = options.ctid;
        let container = MockContainer {
            cores: options.cores,
            memory_mb: options.memory_mb,
            options,
            running: true,
            devices: Vec::new(),
            host_mounts: Vec::new(),
            config: Vec::new(),
            files: BTreeMap::new(),
            detached: Vec::new(),
        };
        self.state().containers.insert(ctid, container);
    }

    pub fn container(&self, ctid: u32) -> Option<MockContainer> {
        self.state().containers.get(&ctid).cloned()
    }

    pub fn containers(&self) -> Vec<u32> {
        self.state().containers.keys().copied().collect()
    }

    pub fn destroyed(&self) -> Vec<u32> {
        self.state().destroyed.clone()
    }

    /// Every command executed so far, buffered or streamed.
    pub fn commands(&self) -> Vec<(u32, Vec<String>)> {
        self.state().commands.clone()
    }

    async fn checkpoint(&self, op: MockOp, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        let mut open = self.gate.subscribe();
        tokio::select! {
            res = open.wait_for(|open| *open) => {
                res.map_err(|_| RuntimeError::System("mock gate dropped".into()))?;
            }
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
        }
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        match self.state().failures.get(&op) {
            Some(msg) => Err(RuntimeError::System(msg.clone())),
            None => Ok(()),
        }
    }

    fn with_container<T>(
        &self,
        ctid: u32,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(&ctid)
            .ok_or_else(|| RuntimeError::NotFound(ctid.to_string()))?;
        Ok(f(container))
    }
}

fn mock_mac(ctid: u32) -> String {
    format!("BC:24:11:00:{:02X}:{:02X}", (ctid >> 8) & 0xff, ctid & 0xff)
}

impl ContainerRuntime for MockRuntime {
    async fn allocate_ctid(&self, cancel: &CancellationToken) -> Result<u32, RuntimeError> {
        self.checkpoint(MockOp::Allocate, cancel).await?;
        let state = self.state();
        let mut ctid = FIRST_CTID;
        while state.containers.contains_key(&ctid) {
            ctid += 1;
        }
        Ok(ctid)
    }

    async fn create(
        &self,
        options: &CreateOptions,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::Create, cancel).await?;
        let mut state = self.state();
        if state.containers.contains_key(&options.ctid) {
            return Err(RuntimeError::InvalidRequest(format!(
                "container {} already exists",
                options.ctid
            )));
        }
        state.containers.insert(
            options.ctid,
            MockContainer {
                options: options.clone(),
                running: false,
                cores: options.cores,
                memory_mb: options.memory_mb,
                devices: Vec::new(),
                host_mounts: Vec::new(),
                config: Vec::new(),
                files: BTreeMap::new(),
                detached: Vec::new(),
            },
        );
        Ok(())
    }

    async fn start(&self, ctid: u32, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::Start, cancel).await?;
        self.with_container(ctid, |c| c.running = true)
    }

    async fn stop(&self, ctid: u32, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::Stop, cancel).await?;
        self.with_container(ctid, |c| c.running = false)
    }

    async fn shutdown(
        &self,
        ctid: u32,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::Shutdown, cancel).await?;
        self.with_container(ctid, |c| c.running = false)
    }

    async fn destroy(
        &self,
        ctid: u32,
        _keep_volumes: bool,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::Destroy, cancel).await?;
        let mut state = self.state();
        match state.containers.remove(&ctid) {
            Some(_) => {
                state.destroyed.push(ctid);
                Ok(())
            }
            None => Err(RuntimeError::NotFound(ctid.to_string())),
        }
    }

    async fn status(&self, ctid: u32) -> Result<ContainerStatusDetail, RuntimeError> {
        if self.state().status_failures.contains(&ctid) {
            return Err(RuntimeError::System(format!("status of {ctid} unavailable")));
        }
        self.with_container(ctid, |c| ContainerStatusDetail {
            state: if c.running {
                ContainerState::Running
            } else {
                ContainerState::Stopped
            },
            uptime_secs: if c.running { 60 } else { 0 },
            cpu: 0.05,
            cpus: c.cores,
            mem_bytes: u64::from(c.memory_mb) * 1024 * 256,
            max_mem_bytes: u64::from(c.memory_mb) * 1024 * 1024,
            disk_bytes: u64::from(c.options.disk_gb) * 1024 * 1024 * 256,
            max_disk_bytes: u64::from(c.options.disk_gb) * 1024 * 1024 * 1024,
            net_in_bytes: 0,
            net_out_bytes: 0,
        })
    }

    async fn ip_address(&self, ctid: u32) -> Result<Option<String>, RuntimeError> {
        self.with_container(ctid, |c| {
            if !c.running {
                return None;
            }
            match &c.options.ip_address {
                Some(ip) => Some(ip.split('/').next().unwrap_or(ip).to_string()),
                None => Some(format!("10.0.{}.{}", ctid / 250, ctid % 250 + 2)),
            }
        })
    }

    async fn hw_addr(&self, ctid: u32) -> Result<Option<String>, RuntimeError> {
        self.with_container(ctid, |c| {
            Some(c.options.hw_addr.clone().unwrap_or_else(|| mock_mac(ctid)))
        })
    }

    async fn volume_ids(&self, ctid: u32) -> Result<BTreeMap<u32, String>, RuntimeError> {
        self.with_container(ctid, |c| {
            c.options
                .mount_points
                .iter()
                .filter(|mp| mp.is_volume() && !c.detached.contains(&mp.index))
                .map(|mp| {
                    let id = mp.volume_id.clone().unwrap_or_else(|| {
                        let storage = mp.storage.as_deref().unwrap_or(&c.options.storage);
                        format!("{storage}:vm-{ctid}-disk-{}", mp.index + 1)
                    });
                    (mp.index, id)
                })
                .collect()
        })
    }

    async fn detach_mount_points(
        &self,
        ctid: u32,
        indexes: &[u32],
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::Detach, cancel).await?;
        self.with_container(ctid, |c| c.detached.extend_from_slice(indexes))
    }

    async fn update_resources(
        &self,
        ctid: u32,
        update: ResourceUpdate,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::UpdateResources, cancel).await?;
        self.with_container(ctid, |c| {
            if let Some(cores) = update.cores {
                c.cores = cores;
            }
            if let Some(memory) = update.memory_mb {
                c.memory_mb = memory;
            }
        })
    }

    async fn configure_devices(
        &self,
        ctid: u32,
        devices: &[DevicePassthrough],
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::ConfigureDevices, cancel).await?;
        self.with_container(ctid, |c| c.devices = devices.to_vec())
    }

    async fn mount_host_path(
        &self,
        ctid: u32,
        mount: &MountPoint,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::MountHostPath, cancel).await?;
        self.with_container(ctid, |c| c.host_mounts.push(mount.clone()))
    }

    async fn append_config(
        &self,
        ctid: u32,
        lines: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::AppendConfig, cancel).await?;
        self.with_container(ctid, |c| c.config.extend_from_slice(lines))
    }

    async fn push_file(
        &self,
        ctid: u32,
        path: &str,
        contents: Bytes,
        _mode: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.checkpoint(MockOp::PushFile, cancel).await?;
        self.with_container(ctid, |c| {
            c.files.insert(path.to_string(), contents);
        })
    }

    async fn exec(
        &self,
        ctid: u32,
        command: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, RuntimeError> {
        self.checkpoint(MockOp::Exec, cancel).await?;
        self.with_container(ctid, |_| ())?;
        let mut state = self.state();
        state.commands.push((ctid, command.to_vec()));
        Ok(state
            .exec_results
            .get(&command.join(" "))
            .cloned()
            .unwrap_or_default())
    }

    async fn exec_stream(
        &self,
        ctid: u32,
        command: &[String],
        _env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<ExecEvent, RuntimeError>>, RuntimeError> {
        self.checkpoint(MockOp::Exec, cancel).await?;
        self.with_container(ctid, |_| ())?;
        let mut state = self.state();
        state.commands.push((ctid, command.to_vec()));
        let events: Vec<Result<ExecEvent, RuntimeError>> = state
            .provision_output
            .iter()
            .cloned()
            .map(|line| Ok(ExecEvent::Stdout(line)))
            .chain(std::iter::once(Ok(ExecEvent::Exited(
                state.provision_exit_code,
            ))))
            .collect();
        Ok(futures::stream::iter(events).boxed())
    }

    async fn host_devices(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.state().host_devices.clone())
    }

    async fn nvidia_library_path(&self) -> Result<Option<String>, RuntimeError> {
        Ok(self.state().nvidia_library_path.clone())
    }
}

/// A catalog backed by a fixed set of manifests.
#[derive(Clone, Default)]
pub struct StaticCatalog {
    apps: Arc<Mutex<HashMap<String, AppManifest>>>,
    templates: Arc<Mutex<HashMap<String, Vec<ProvisionFile>>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(self, manifest: AppManifest) -> Self {
        self.insert(manifest);
        self
    }

    /// Ships a config template with an app.
    pub fn with_template(self, app_id: &str, path: &str, contents: &'static str) -> Self {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(app_id.to_string())
            .or_default()
            .push(ProvisionFile {
                path: path.to_string(),
                contents: Bytes::from_static(contents.as_bytes()),
            });
        self
    }

    /// Adds or replaces a manifest, e.g. to publish a new version.
    pub fn insert(&self, manifest: AppManifest) {
        self.apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(manifest.id.clone(), manifest);
    }
}

impl Catalog for StaticCatalog {
    fn get_app(&self, app_id: &str) -> Option<AppManifest> {
        self.apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .cloned()
    }

    fn provision_files(&self, app_id: &str) -> Vec<ProvisionFile> {
        self.get_app(app_id)
            .map(|m| {
                let name = m.provisioning.script.rsplit('/').next().unwrap_or_default();
                vec![ProvisionFile {
                    path: name.to_string(),
                    contents: Bytes::from(format!("# provisioning for {}\n", m.id)),
                }]
            })
            .unwrap_or_default()
    }

    fn template_files(&self, app_id: &str) -> Vec<ProvisionFile> {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .cloned()
            .unwrap_or_default()
    }

    fn sdk_files(&self) -> Vec<ProvisionFile> {
        ["appstore/__init__.py", "appstore/runner.py"]
            .into_iter()
            .map(|path| ProvisionFile {
                path: path.to_string(),
                contents: Bytes::from_static(b"# mock sdk\n"),
            })
            .collect()
    }
}
