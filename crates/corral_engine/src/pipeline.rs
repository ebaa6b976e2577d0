//! Container build, provisioning and teardown steps shared by installs and stacks.

use crate::{
    engine::{Ctx, EngineInner},
    scheduler::{JobError, JobResultExt},
    validate,
};
use corral_core::prelude::*;

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, path::Path, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The steps a job moves through. Recorded on the job as it enters each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ValidateManifest,
    ValidatePlacement,
    AllocateCtid,
    CreateContainer,
    ReadVolumeIds,
    ConfigureContainer,
    StartContainer,
    WaitForNetwork,
    SetupGpuRuntime,
    InstallBasePackages,
    PushSdk,
    PushAssets,
    Provision,
    Healthcheck,
    CollectOutputs,
    StopContainer,
    DetachVolumes,
    DestroyContainer,
    ApplyResources,
    Configure,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ValidateManifest => "validate_manifest",
            Step::ValidatePlacement => "validate_placement",
            Step::AllocateCtid => "allocate_ctid",
            Step::CreateContainer => "create_container",
            Step::ReadVolumeIds => "read_volume_ids",
            Step::ConfigureContainer => "configure_container",
            Step::StartContainer => "start_container",
            Step::WaitForNetwork => "wait_for_network",
            Step::SetupGpuRuntime => "setup_gpu_runtime",
            Step::InstallBasePackages => "install_base_packages",
            Step::PushSdk => "push_sdk",
            Step::PushAssets => "push_assets",
            Step::Provision => "provision",
            Step::Healthcheck => "healthcheck",
            Step::CollectOutputs => "collect_outputs",
            Step::StopContainer => "stop_container",
            Step::DetachVolumes => "detach_volumes",
            Step::DestroyContainer => "destroy_container",
            Step::ApplyResources => "apply_resources",
            Step::Configure => "configure",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContainerPlan {
    pub os_template: String,
    pub storage: String,
    pub bridge: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub hostname: String,
    pub ip_address: Option<String>,
    /// MAC address to keep across a recreate.
    pub hw_addr: Option<String>,
    pub onboot: bool,
    pub unprivileged: bool,
    pub features: Vec<String>,
    pub tags: String,
    pub mount_points: Vec<MountPoint>,
    pub devices: Vec<DevicePassthrough>,
    pub extra_config: Vec<String>,
}

impl ContainerPlan {
    fn create_options(&self, ctid: u32) -> CreateOptions {
        CreateOptions {
            ctid,
            os_template: self.os_template.clone(),
            storage: self.storage.clone(),
            disk_gb: self.disk_gb,
            cores: self.cores,
            memory_mb: self.memory_mb,
            bridge: self.bridge.clone(),
            hostname: self.hostname.clone(),
            ip_address: self.ip_address.clone().filter(|ip| ip != "dhcp"),
            hw_addr: self.hw_addr.clone(),
            onboot: self.onboot,
            unprivileged: self.unprivileged,
            features: self.features.clone(),
            tags: self.tags.clone(),
            mount_points: self.mount_points.clone(),
        }
    }
}

/// Tag list of an engine-managed container.
pub(crate) fn container_tags(extra: Option<&str>) -> String {
    let base = format!("{};managed", provision::CONTAINER_TAG);
    match extra.map(str::trim).filter(|e| !e.is_empty()) {
        Some(extra) => format!("{base};{extra}"),
        None => base,
    }
}

/// A container created and started by [`EngineInner::build_container`].
#[derive(Debug, Clone)]
pub(crate) struct Container {
    pub ctid: u32,
    /// Mount points with the volume ids the runtime assigned.
    pub mount_points: Vec<MountPoint>,
    pub mac_address: Option<String>,
}

/// One app to provision inside a running container.
pub(crate) struct AppRun<'a> {
    pub manifest: &'a AppManifest,
    pub inputs: &'a BTreeMap<String, String>,
    pub env_vars: &'a BTreeMap<String, String>,
    pub permissions: &'a PermissionsSpec,
    /// Prefix of relayed provisioning output, e.g. `provision` or the app id.
    pub label: &'a str,
}

impl AppRun<'_> {
    /// Manifest provisioning env overlaid with the caller's env vars.
    fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.manifest.provisioning.env.clone();
        env.extend(self.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Sleeps unless the job is cancelled first.
pub(crate) async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<(), JobError> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// The argv that runs `action` of a provisioning script through the in-container runner.
pub(crate) fn runner_command(script: &str, action: &str) -> Vec<String> {
    let script = Path::new(script)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(script);
    vec![
        "env".to_string(),
        format!("PYTHONPATH={}", paths::SDK_DIR),
        "python3".to_string(),
        "-m".to_string(),
        "appstore.runner".to_string(),
        paths::INPUTS_FILE.to_string(),
        paths::PERMISSIONS_FILE.to_string(),
        action.to_string(),
        format!("{}/{script}", paths::PROVISION_DIR),
    ]
}

#[derive(Deserialize)]
struct AppLog {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

/// One line of runner output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProvisionLine {
    Log(LogLevel, String),
    Output(String, String),
    Plain(String),
}

pub(crate) fn parse_line(line: &str) -> Option<ProvisionLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(json) = line.strip_prefix(provision::APPLOG_PREFIX) else {
        return Some(ProvisionLine::Plain(line.to_string()));
    };
    let Ok(record) = serde_json::from_str::<AppLog>(json) else {
        return Some(ProvisionLine::Plain(line.to_string()));
    };
    if record.level == "output" {
        if record.key.is_empty() {
            return None;
        }
        let value = match record.value {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        return Some(ProvisionLine::Output(record.key, value));
    }
    if record.msg.is_empty() {
        return None;
    }
    let level = match record.level.as_str() {
        "error" => LogLevel::Error,
        "warn" | "warning" => LogLevel::Warn,
        _ => LogLevel::Info,
    };
    Some(ProvisionLine::Log(level, record.msg))
}

/// Renders manifest output templates. `{{ip}}`/`{{IP}}` and `{{<input key>}}` are substituted.
pub(crate) fn render_outputs(
    manifest: &AppManifest,
    inputs: &BTreeMap<String, String>,
    ip: &str,
) -> BTreeMap<String, String> {
    manifest
        .outputs
        .iter()
        .map(|out| {
            let mut value = out.value.replace("{{IP}}", ip).replace("{{ip}}", ip);
            for (k, v) in inputs {
                value = value.replace(&format!("{{{{{k}}}}}"), v);
            }
            (out.key.clone(), value)
        })
        .collect()
}

impl<S: EngineServices> EngineInner<S> {
    /// Storage and bridge must be configured ones.
    pub(crate) fn check_placement(&self, plan: &ContainerPlan) -> Result<(), JobError> {
        let storage_known = |s: &str| self.config.storages.iter().any(|c| c == s);
        if !storage_known(&plan.storage) {
            return Err(JobError::failed(format!(
                "storage {:?} is not configured",
                plan.storage
            )));
        }
        if !self.config.bridges.iter().any(|b| *b == plan.bridge) {
            return Err(JobError::failed(format!(
                "bridge {:?} is not configured",
                plan.bridge
            )));
        }
        for mp in &plan.mount_points {
            if let Some(storage) = mp.storage.as_deref().filter(|s| !storage_known(*s)) {
                return Err(JobError::failed(format!(
                    "storage {storage:?} of volume {} is not configured",
                    mp.name
                )));
            }
        }
        Ok(())
    }

    /// Allocates, creates, configures and starts a container, then readies it for provisioning.
    ///
    /// `created` is set as soon as the container exists, so callers can clean up after a
    /// later failure.
    pub(crate) async fn build_container(
        &self,
        ctx: &Ctx<S>,
        plan: &ContainerPlan,
        created: &mut Option<u32>,
    ) -> Result<Container, JobError> {
        let runtime = self.services.runtime();
        let token = ctx.token();

        ctx.enter(Step::AllocateCtid).await?;
        // The runtime hands out the same id until a container exists, so allocation
        // and creation are one critical section across all jobs.
        let serial = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(JobError::Cancelled),
            guard = self.ctid_lock.clone().lock_owned() => guard,
        };
        let ctid = runtime
            .allocate_ctid(token)
            .await
            .context("allocating container id")?;
        ctx.info(format!("Allocated CTID: {ctid}")).await;

        ctx.enter(Step::CreateContainer).await?;
        if !plan.mount_points.is_empty() {
            ctx.info(format!("Configuring {} mount(s)", plan.mount_points.len()))
                .await;
        }
        ctx.info(format!(
            "Creating container {ctid} (template={}, {} cores, {} MB, {} GB)",
            plan.os_template, plan.cores, plan.memory_mb, plan.disk_gb
        ))
        .await;
        runtime.create(&plan.create_options(ctid), token).await?;
        drop(serial);
        *created = Some(ctid);
        ctx.set_ctid(ctid).await;
        ctx.info(format!("Container {ctid} created")).await;

        let mac_address = match runtime.hw_addr(ctid).await {
            Ok(mac) => mac.or_else(|| plan.hw_addr.clone()),
            Err(_) => plan.hw_addr.clone(),
        };

        let mut mount_points = plan.mount_points.clone();
        if mount_points.iter().any(MountPoint::is_volume) {
            ctx.enter(Step::ReadVolumeIds).await?;
            match self.refresh_volume_ids(ctid, &mut mount_points).await {
                Ok(()) => {
                    for mp in mount_points.iter().filter(|mp| mp.is_volume()) {
                        if let Some(id) = &mp.volume_id {
                            ctx.info(format!("Volume {} (mp{}): {id}", mp.name, mp.index))
                                .await;
                        }
                    }
                }
                Err(e) => {
                    ctx.warn(format!("Failed to read volume ids: {e}")).await;
                }
            }
        }

        ctx.enter(Step::ConfigureContainer).await?;
        if !plan.devices.is_empty() {
            ctx.info(format!(
                "Configuring {} device passthrough(s)",
                plan.devices.len()
            ))
            .await;
            runtime
                .configure_devices(ctid, &plan.devices, token)
                .await
                .context("configuring devices")?;
            if plan.devices.iter().any(DevicePassthrough::is_nvidia) {
                self.mount_nvidia_libraries(ctx, ctid, &plan.mount_points)
                    .await?;
            }
        }
        if !plan.extra_config.is_empty() {
            validate::extra_config(&plan.extra_config).context("extra config")?;
            ctx.info(format!(
                "Applying {} extra config line(s)",
                plan.extra_config.len()
            ))
            .await;
            runtime
                .append_config(ctid, &plan.extra_config, token)
                .await
                .context("applying extra config")?;
        }

        ctx.enter(Step::StartContainer).await?;
        runtime.start(ctid, token).await?;
        ctx.info(format!("Container {ctid} started")).await;

        ctx.enter(Step::WaitForNetwork).await?;
        self.wait_for_network(ctx, ctid).await?;

        if plan.devices.iter().any(DevicePassthrough::is_nvidia) {
            ctx.enter(Step::SetupGpuRuntime).await?;
            self.setup_gpu_runtime(ctx, ctid).await?;
        }

        ctx.enter(Step::InstallBasePackages).await?;
        if self.config.base_packages.is_empty() {
            ctx.info("No base packages configured").await;
        } else {
            ctx.info(format!(
                "Installing base packages: {}",
                self.config.base_packages.join(", ")
            ))
            .await;
            self.apt_install(ctx, ctid, &self.config.base_packages)
                .await
                .context("installing base packages")?;
        }

        ctx.enter(Step::PushSdk).await?;
        self.push_sdk(ctx, ctid).await?;

        Ok(Container {
            ctid,
            mount_points,
            mac_address,
        })
    }

    /// Bind-mounts the host's NVIDIA libraries into the next free mount slot.
    ///
    /// A host without libraries or a failed mount is only a warning.
    async fn mount_nvidia_libraries(
        &self,
        ctx: &Ctx<S>,
        ctid: u32,
        mount_points: &[MountPoint],
    ) -> Result<(), JobError> {
        let runtime = self.services.runtime();
        let host_path = match runtime.nvidia_library_path().await {
            Ok(Some(path)) => path,
            Ok(None) => {
                ctx.warn("No NVIDIA libraries found on host, GPU may not work inside container")
                    .await;
                return Ok(());
            }
            Err(e) => {
                ctx.warn(format!(
                    "Could not resolve NVIDIA libraries: {e}, GPU may not work inside container"
                ))
                .await;
                return Ok(());
            }
        };

        let index = mount_points
            .iter()
            .map(|mp| mp.index + 1)
            .max()
            .unwrap_or_default();
        let mount = MountPoint {
            index,
            name: gpu::NVIDIA_LIBS_MOUNT.to_string(),
            kind: MountKind::Bind,
            mount_path: gpu::NVIDIA_LIB_DIR.to_string(),
            size_gb: None,
            volume_id: None,
            host_path: Some(host_path.clone()),
            storage: None,
            read_only: true,
        };
        ctx.info(format!(
            "Bind-mounting NVIDIA libraries from {host_path} to {} (mp{index})",
            gpu::NVIDIA_LIB_DIR
        ))
        .await;
        match runtime.mount_host_path(ctid, &mount, ctx.token()).await {
            Ok(()) => {}
            Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) => {
                ctx.warn(format!(
                    "Failed to mount NVIDIA libraries: {e}, GPU may not work inside container"
                ))
                .await;
            }
        }
        Ok(())
    }

    /// Registers the mounted NVIDIA libraries with the dynamic linker. Failures are warnings.
    async fn setup_gpu_runtime(&self, ctx: &Ctx<S>, ctid: u32) -> Result<(), JobError> {
        let runtime = self.services.runtime();
        let token = ctx.token();
        ctx.info("Setting up NVIDIA runtime inside container...").await;

        let ldconf = format!("echo '{}' > {}", gpu::NVIDIA_LIB_DIR, gpu::NVIDIA_LDCONF);
        let commands = [
            argv(&["mkdir", "-p", "/etc/ld.so.conf.d"]),
            argv(&["sh", "-c", &ldconf]),
            argv(&["ldconfig"]),
        ];
        for command in &commands {
            match runtime.exec(ctid, command, token).await {
                Ok(out) if out.exit_code == 0 => {}
                Ok(out) => {
                    ctx.warn(format!(
                        "GPU runtime command `{}` exited {}: {}",
                        command.join(" "),
                        out.exit_code,
                        out.stderr.trim()
                    ))
                    .await;
                }
                Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => {
                    ctx.warn(format!("GPU runtime setup command failed: {e}")).await;
                    return Ok(());
                }
            }
        }

        let query = argv(&["nvidia-smi", "--query-gpu=name", "--format=csv,noheader"]);
        match runtime.exec(ctid, &query, token).await {
            Ok(out) if out.exit_code == 0 => {
                ctx.info(format!(
                    "NVIDIA GPU accessible inside container: {}",
                    out.stdout.trim()
                ))
                .await;
                return Ok(());
            }
            Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
            _ => {}
        }
        // nvidia-smi is not always part of the mounted libraries.
        match runtime.exec(ctid, &argv(&["ldconfig", "-p"]), token).await {
            Ok(out) if out.stdout.contains("libcuda") => {
                ctx.info("NVIDIA CUDA libraries available (ldconfig lists libcuda)")
                    .await;
            }
            Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
            _ => {
                ctx.warn("NVIDIA GPU libraries may not be fully available inside container")
                    .await;
            }
        }
        Ok(())
    }

    /// Runs `apt-get update` and `apt-get install -y`. Only the install's exit status counts.
    async fn apt_install(&self, ctx: &Ctx<S>, ctid: u32, packages: &[String]) -> Result<(), JobError> {
        let runtime = self.services.runtime();
        let token = ctx.token();

        let update = runtime
            .exec(ctid, &argv(&["apt-get", "update"]), token)
            .await
            .context("apt-get update")?;
        if update.exit_code != 0 {
            ctx.warn(format!("apt-get update exited with {}", update.exit_code))
                .await;
        }

        let mut install = argv(&["apt-get", "install", "-y"]);
        install.extend(packages.iter().cloned());
        let out = runtime
            .exec(ctid, &install, token)
            .await
            .context("apt-get install")?;
        if out.exit_code != 0 {
            return Err(JobError::failed(format!(
                "apt-get install exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Makes sure python3 exists, then pushes the runner SDK.
    async fn push_sdk(&self, ctx: &Ctx<S>, ctid: u32) -> Result<(), JobError> {
        let runtime = self.services.runtime();
        let token = ctx.token();

        ctx.info("Verifying python3 is available...").await;
        match runtime.exec(ctid, &argv(&["which", "python3"]), token).await {
            Ok(out) if out.exit_code == 0 => {}
            Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
            _ => {
                ctx.info("python3 not found, installing it...").await;
                self.apt_install(ctx, ctid, &["python3".to_string()])
                    .await
                    .context("ensuring python3")?;
            }
        }

        let files = self.services.catalog().sdk_files();
        if files.is_empty() {
            ctx.warn("No SDK files available, skipping SDK push").await;
            return Ok(());
        }
        ctx.info(format!("Pushing Python SDK ({} file(s))...", files.len()))
            .await;
        for file in files {
            let dest = format!("{}/{}", paths::SDK_DIR, file.path.trim_start_matches('/'));
            runtime
                .push_file(ctid, &dest, file.contents, "0644", token)
                .await
                .context(format!("pushing SDK file {}", file.path))?;
        }
        Ok(())
    }

    /// Copies the runtime's volume ids onto the managed volumes of `mount_points`.
    pub(crate) async fn refresh_volume_ids(
        &self,
        ctid: u32,
        mount_points: &mut [MountPoint],
    ) -> Result<(), RuntimeError> {
        let ids = self.services.runtime().volume_ids(ctid).await?;
        for mp in mount_points.iter_mut().filter(|mp| mp.is_volume()) {
            if let Some(id) = ids.get(&mp.index) {
                mp.volume_id = Some(id.clone());
            }
        }
        Ok(())
    }

    /// Polls for an address. Running out of attempts is not an error.
    async fn wait_for_network(&self, ctx: &Ctx<S>, ctid: u32) -> Result<Option<String>, JobError> {
        ctx.info(format!("Waiting for network in container {ctid}...")).await;
        for _ in 0..self.config.network_wait_attempts {
            if let Ok(Some(ip)) = self.services.runtime().ip_address(ctid).await
                && !ip.is_empty()
                && ip != "127.0.0.1"
            {
                ctx.info(format!("Container {ctid} has IP: {ip}")).await;
                return Ok(Some(ip));
            }
            pause(ctx.token(), self.config.network_wait_interval()).await?;
        }
        ctx.warn("Network wait timed out, continuing anyway").await;
        Ok(None)
    }

    /// Pushes assets, runs the install action and collects outputs of one app.
    pub(crate) async fn provision_app(
        &self,
        ctx: &Ctx<S>,
        ctid: u32,
        app: &AppRun<'_>,
    ) -> Result<BTreeMap<String, String>, JobError> {
        ctx.enter(Step::PushAssets).await?;
        self.push_assets(ctx, ctid, app).await?;

        ctx.enter(Step::Provision).await?;
        let mut outputs = if app.manifest.provisioning.script.is_empty() {
            ctx.warn("No provisioning script, skipping").await;
            BTreeMap::new()
        } else {
            let outputs = self.run_action(ctx, ctid, app, actions::INSTALL).await?;
            ctx.info("Provisioning completed successfully").await;
            outputs
        };

        ctx.enter(Step::Healthcheck).await?;
        self.healthcheck(ctx, ctid, app).await;

        ctx.enter(Step::CollectOutputs).await?;
        if app.manifest.outputs.is_empty() {
            ctx.info("No outputs defined").await;
        } else {
            let ip = self
                .services
                .runtime()
                .ip_address(ctid)
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            let rendered = render_outputs(app.manifest, app.inputs, &ip);
            for out in &app.manifest.outputs {
                if let Some(value) = rendered.get(&out.key) {
                    ctx.info(format!("Output: {} = {value}", out.label)).await;
                }
            }
            outputs.extend(rendered);
        }
        Ok(outputs)
    }

    pub(crate) async fn push_inputs(
        &self,
        ctid: u32,
        inputs: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let json = serde_json::to_vec_pretty(inputs)
            .map_err(|e| JobError::failed(format!("encoding inputs: {e}")))?;
        self.services
            .runtime()
            .push_file(ctid, paths::INPUTS_FILE, Bytes::from(json), "0600", cancel)
            .await
            .context("pushing inputs")
    }

    async fn push_assets(&self, ctx: &Ctx<S>, ctid: u32, app: &AppRun<'_>) -> Result<(), JobError> {
        let runtime = self.services.runtime();
        let token = ctx.token();

        ctx.info("Pushing inputs and permissions...").await;
        self.push_inputs(ctid, app.inputs, token).await?;
        let permissions = serde_json::to_vec_pretty(app.permissions)
            .map_err(|e| JobError::failed(format!("encoding permissions: {e}")))?;
        runtime
            .push_file(
                ctid,
                paths::PERMISSIONS_FILE,
                Bytes::from(permissions),
                "0644",
                token,
            )
            .await
            .context("pushing permissions")?;

        for file in self.services.catalog().provision_files(&app.manifest.id) {
            let dest = format!("{}/{}", paths::PROVISION_DIR, file.path.trim_start_matches('/'));
            ctx.info(format!("Pushing {} -> {dest}", file.path)).await;
            runtime
                .push_file(ctid, &dest, file.contents, "0755", token)
                .await
                .context(format!("pushing {}", file.path))?;
        }
        for file in self.services.catalog().template_files(&app.manifest.id) {
            let dest = format!("{}/{}", paths::TEMPLATES_DIR, file.path.trim_start_matches('/'));
            ctx.info(format!("Pushing template {} -> {dest}", file.path)).await;
            runtime
                .push_file(ctid, &dest, file.contents, "0644", token)
                .await
                .context(format!("pushing template {}", file.path))?;
        }
        ctx.info(format!("Assets pushed to container {ctid}")).await;
        Ok(())
    }

    /// Runs a runner action with streamed output. Returns the outputs the script reported.
    pub(crate) async fn run_action(
        &self,
        ctx: &Ctx<S>,
        ctid: u32,
        app: &AppRun<'_>,
        action: &str,
    ) -> Result<BTreeMap<String, String>, JobError> {
        let token = ctx.token();
        let command = runner_command(&app.manifest.provisioning.script, action);
        ctx.info(format!(
            "Running provisioning: python3 -m appstore.runner ... {action} {}",
            command.last().map(String::as_str).unwrap_or_default()
        ))
        .await;

        let mut stream = self
            .services
            .runtime()
            .exec_stream(ctid, &command, &app.env(), token)
            .await
            .context("executing provision script")?;

        let deadline = app
            .manifest
            .provisioning
            .timeout_sec
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut outputs = BTreeMap::new();
        let mut last_error: Option<String> = None;
        let exit_code = loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(JobError::Cancelled),
                _ = &mut expired => {
                    return Err(JobError::failed(format!(
                        "{action} timed out after {}s",
                        app.manifest.provisioning.timeout_sec.unwrap_or_default()
                    )));
                }
                event = stream.next() => event,
            };
            match event {
                None => break None,
                Some(Ok(ExecEvent::Exited(code))) => break Some(code),
                Some(Ok(ExecEvent::Stdout(line) | ExecEvent::Stderr(line))) => {
                    match parse_line(&line) {
                        Some(ProvisionLine::Output(key, value)) => {
                            outputs.insert(key, value);
                        }
                        Some(ProvisionLine::Log(level, msg)) => {
                            if level == LogLevel::Error {
                                last_error = Some(msg.clone());
                            }
                            ctx.log(level, format!("[{}] {msg}", app.label)).await;
                        }
                        Some(ProvisionLine::Plain(text)) => {
                            ctx.info(format!("[{}] {text}", app.label)).await;
                        }
                        None => {}
                    }
                }
                Some(Err(e)) => return Err(e).context("reading provision output"),
            }
        };

        match exit_code {
            Some(0) => Ok(outputs),
            Some(code) => Err(JobError::failed(match last_error {
                Some(msg) => format!("{action} failed: {msg}"),
                None if code == provision::EXIT_PERMISSION_DENIED => {
                    format!("{action} failed: permission denied (exit {code})")
                }
                None => format!("{action} script exited with code {code}"),
            })),
            None => Err(JobError::failed(format!(
                "{action} output ended without an exit status"
            ))),
        }
    }

    /// Failures are reported in the log only.
    async fn healthcheck(&self, ctx: &Ctx<S>, ctid: u32, app: &AppRun<'_>) {
        if app.manifest.provisioning.script.is_empty() {
            ctx.info("No provisioning script, skipping healthcheck").await;
            return;
        }
        ctx.info("Running healthcheck...").await;
        let command = runner_command(&app.manifest.provisioning.script, actions::HEALTHCHECK);
        let output = match self
            .services
            .runtime()
            .exec(ctid, &command, ctx.token())
            .await
        {
            Ok(output) => output,
            Err(e) => {
                ctx.warn(format!("Healthcheck error: {e}")).await;
                return;
            }
        };
        for line in output.stdout.lines() {
            match parse_line(line) {
                Some(ProvisionLine::Log(level, msg)) => {
                    ctx.log(level, format!("[{}] {msg}", app.label)).await;
                }
                Some(ProvisionLine::Plain(text)) => {
                    ctx.info(format!("[{}] {text}", app.label)).await;
                }
                _ => {}
            }
        }
        if output.exit_code == 0 {
            ctx.info("Healthcheck passed").await;
        } else {
            ctx.warn(format!("Healthcheck failed (exit {})", output.exit_code))
                .await;
        }
    }

    /// Destroys a container, retrying on failure. A container that is already gone counts as destroyed.
    pub(crate) async fn destroy_container(
        &self,
        ctx: &Ctx<S>,
        ctid: u32,
        keep_volumes: bool,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let attempts = self.config.destroy_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .services
                .runtime()
                .destroy(ctid, keep_volumes, cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(RuntimeError::NotFound(_)) => {
                    ctx.info(format!("Container {ctid} already removed")).await;
                    return Ok(());
                }
                Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) if attempt == attempts => {
                    return Err(e).context(format!("destroying container {ctid}"));
                }
                Err(e) => {
                    ctx.warn(format!("Destroy attempt {attempt} failed: {e}"))
                        .await;
                    pause(cancel, self.config.destroy_retry_delay()).await?;
                }
            }
        }
        Ok(())
    }

    /// Best-effort removal of a container a failed or cancelled job created.
    ///
    /// Runs on a fresh token since the job's own token may already be cancelled.
    pub(crate) async fn discard_container(&self, ctx: &Ctx<S>, ctid: u32) {
        let cancel = CancellationToken::new();
        ctx.info(format!("Cleaning up container {ctid}...")).await;
        if let Err(e) = self.services.runtime().stop(ctid, &cancel).await
            && !matches!(e, RuntimeError::NotFound(_))
        {
            tracing::debug!("Stop before cleanup of container {ctid} failed: {e}");
        }
        match self.destroy_container(ctx, ctid, false, &cancel).await {
            Ok(()) => ctx.info(format!("Container {ctid} destroyed")).await,
            Err(e) => {
                tracing::warn!("Failed to clean up container {ctid}: {e}");
                ctx.warn(format!("Failed to destroy container {ctid}: {e}"))
                    .await;
            }
        }
    }

    /// Stops and destroys a container that is about to be replaced, keeping its managed volumes.
    ///
    /// Refreshes the volume ids in `mount_points` and returns the container's MAC address.
    pub(crate) async fn teardown_for_recreate(
        &self,
        ctx: &Ctx<S>,
        ctid: u32,
        mount_points: &mut [MountPoint],
    ) -> Result<Option<String>, JobError> {
        let runtime = self.services.runtime();
        let token = ctx.token();

        let mac = match runtime.hw_addr(ctid).await {
            Ok(mac) => mac,
            Err(e) => {
                ctx.warn(format!("Could not read MAC address of container {ctid}: {e}"))
                    .await;
                None
            }
        };
        if let Some(mac) = &mac {
            ctx.info(format!("Preserved MAC address: {mac}")).await;
        }

        let managed: Vec<u32> = mount_points
            .iter()
            .filter(|mp| mp.is_volume())
            .map(|mp| mp.index)
            .collect();
        let mut detached = false;
        if !managed.is_empty() {
            ctx.enter(Step::DetachVolumes).await?;
            if let Err(e) = self.refresh_volume_ids(ctid, mount_points).await {
                ctx.warn(format!("Failed to read volume ids: {e}")).await;
            }
            ctx.info(format!("Detaching {} volume(s) before destroy...", managed.len()))
                .await;
            match runtime.detach_mount_points(ctid, &managed, token).await {
                Ok(()) => detached = true,
                Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => {
                    ctx.warn(format!(
                        "Failed to detach mount points: {e}, volumes may be destroyed"
                    ))
                    .await;
                }
            }
        }

        ctx.enter(Step::StopContainer).await?;
        ctx.info(format!("Stopping container {ctid}...")).await;
        match runtime
            .shutdown(ctid, self.config.shutdown_timeout(), token)
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) => {
                ctx.warn(format!("Graceful shutdown failed: {e}, forcing stop"))
                    .await;
                if let Err(e) = runtime.stop(ctid, token).await
                    && !matches!(e, RuntimeError::NotFound(_))
                {
                    ctx.warn(format!("Force stop error: {e}")).await;
                }
            }
        }

        ctx.enter(Step::DestroyContainer).await?;
        self.destroy_container(ctx, ctid, detached, token).await?;
        ctx.info(format!("Old container {ctid} destroyed")).await;
        pause(token, self.config.recreate_settle()).await?;
        Ok(mac)
    }
}
