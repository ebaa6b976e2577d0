use crate::{
    entity::{ContainerStatusDetail, DevicePassthrough, Install, MountPoint, Stack},
    error::*,
    job::{Job, LogEntry},
    manifest::AppManifest,
};

use bytes::Bytes;
use futures::stream::BoxStream;
use std::{collections::BTreeMap, collections::HashMap, time::Duration};
use tokio_util::sync::CancellationToken;

/// A file shipped with an app that is pushed into the container before provisioning.
#[derive(Debug, Clone)]
pub struct ProvisionFile {
    /// Path relative to the provisioning directory inside the container.
    pub path: String,
    pub contents: Bytes,
}

/// A trait for looking up application manifests.
pub trait Catalog: Send + Sync + 'static + Clone {
    /// Returns the manifest of an app, [`None`] if the catalog does not know it.
    fn get_app(&self, app_id: &str) -> Option<AppManifest>;

    /// Optional: Files to push into the container alongside the provisioning script.
    fn provision_files(&self, _app_id: &str) -> Vec<ProvisionFile> {
        Vec::new()
    }

    /// Optional: Config templates of an app, pushed next to the provisioning files.
    fn template_files(&self, _app_id: &str) -> Vec<ProvisionFile> {
        Vec::new()
    }

    /// Optional: The python SDK the provisioning runner imports. Paths are relative to the SDK directory.
    fn sdk_files(&self) -> Vec<ProvisionFile> {
        Vec::new()
    }
}

/// Everything needed to create a container in one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub ctid: u32,
    pub os_template: String,
    pub storage: String,
    pub disk_gb: u32,
    pub cores: u32,
    pub memory_mb: u32,
    pub bridge: String,
    pub hostname: String,
    /// [`None`] for DHCP.
    pub ip_address: Option<String>,
    /// MAC address to reuse when recreating a container.
    pub hw_addr: Option<String>,
    pub onboot: bool,
    pub unprivileged: bool,
    pub features: Vec<String>,
    /// Semicolon-separated tag list.
    pub tags: String,
    pub mount_points: Vec<MountPoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUpdate {
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One event of a streamed command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(String),
    Stderr(String),
    /// Always the last event of a stream.
    Exited(i32),
}

/// A trait for injecting the container runtime into the engine.
///
/// Long-running calls receive the job's cancellation token and should return
/// [`RuntimeError::Cancelled`] once it fires.
pub trait ContainerRuntime: Send + Sync + 'static + Clone {
    /// Reserves the next free container id.
    fn allocate_ctid(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<u32, RuntimeError>> + Send;

    fn create(
        &self,
        options: &CreateOptions,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn start(
        &self,
        ctid: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Forced stop.
    fn stop(
        &self,
        ctid: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Graceful shutdown, waiting at most `timeout`.
    fn shutdown(
        &self,
        ctid: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Removes the container. With `keep_volumes` detached volumes are left on storage.
    fn destroy(
        &self,
        ctid: u32,
        keep_volumes: bool,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn status(
        &self,
        ctid: u32,
    ) -> impl Future<Output = Result<ContainerStatusDetail, RuntimeError>> + Send;

    /// The container's current IPv4 address, [`None`] while it has none.
    fn ip_address(
        &self,
        ctid: u32,
    ) -> impl Future<Output = Result<Option<String>, RuntimeError>> + Send;

    fn hw_addr(&self, ctid: u32)
    -> impl Future<Output = Result<Option<String>, RuntimeError>> + Send;

    /// Mount slot index -> runtime volume id.
    fn volume_ids(
        &self,
        ctid: u32,
    ) -> impl Future<Output = Result<BTreeMap<u32, String>, RuntimeError>> + Send;

    fn detach_mount_points(
        &self,
        ctid: u32,
        indexes: &[u32],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn update_resources(
        &self,
        ctid: u32,
        update: ResourceUpdate,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Bind-mounts a host directory into an existing container.
    fn mount_host_path(
        &self,
        ctid: u32,
        mount: &MountPoint,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn configure_devices(
        &self,
        ctid: u32,
        devices: &[DevicePassthrough],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Appends raw config lines to the container definition.
    fn append_config(
        &self,
        ctid: u32,
        lines: &[String],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn push_file(
        &self,
        ctid: u32,
        path: &str,
        contents: Bytes,
        mode: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn exec(
        &self,
        ctid: u32,
        command: &[String],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ExecOutput, RuntimeError>> + Send;

    /// Runs a command and streams its output. The stream ends with [`ExecEvent::Exited`].
    fn exec_stream(
        &self,
        ctid: u32,
        command: &[String],
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> impl Future<
        Output = Result<BoxStream<'static, Result<ExecEvent, RuntimeError>>, RuntimeError>,
    > + Send;

    /// Device nodes present on the host, used to resolve GPU profiles.
    fn host_devices(&self) -> impl Future<Output = Result<Vec<String>, RuntimeError>> + Send;

    /// Host directory holding the NVIDIA userspace libraries, [`None`] if there are none.
    fn nvidia_library_path(
        &self,
    ) -> impl Future<Output = Result<Option<String>, RuntimeError>> + Send;
}

/// Everything a [`StateBackend`] persisted, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub jobs: Vec<Job>,
    pub logs: HashMap<String, Vec<LogEntry>>,
    pub installs: Vec<Install>,
    pub stacks: Vec<Stack>,
}

/// A trait for injecting persistence into the engine.
///
/// Records are written through one at a time; the engine keeps the working set in memory.
pub trait StateBackend: Send + Sync + 'static + Clone {
    fn load(&self) -> impl Future<Output = Result<StateSnapshot, StorageError>> + Send;

    fn write_job(&self, job: &Job) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Deletes a job and its log.
    fn delete_job(&self, id: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn append_log(
        &self,
        job_id: &str,
        entry: &LogEntry,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn write_install(
        &self,
        install: &Install,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_install(&self, id: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn write_stack(&self, stack: &Stack) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_stack(&self, id: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// The capabilities an engine is composed from.
pub trait EngineServices: Send + Sync + 'static + Clone {
    type Catalog: Catalog;
    type Runtime: ContainerRuntime;
    type Backend: StateBackend;

    fn catalog(&self) -> &Self::Catalog;
    fn runtime(&self) -> &Self::Runtime;
    fn backend(&self) -> &Self::Backend;
}
