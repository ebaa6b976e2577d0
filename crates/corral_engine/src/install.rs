//! Single-app installs: admission, the install pipeline and every follow-up operation.

use crate::{
    engine::{Ctx, Engine, EngineInner},
    guard::GuardKey,
    pipeline::{AppRun, ContainerPlan, Step, container_tags, pause},
    resolver::{self, DeviceRequest, MountRequest},
    scheduler::{JobError, JobResultExt},
    validate,
};
use corral_core::prelude::*;

use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Everything a worker needs to provision one app into a new container.
struct InstallWork {
    install_id: String,
    manifest: AppManifest,
    plan: ContainerPlan,
    inputs: BTreeMap<String, String>,
    env_vars: BTreeMap<String, String>,
}

/// Settings of an existing install the caller wants changed on recreate.
#[derive(Debug, Clone, Default)]
struct Overrides {
    cores: Option<u32>,
    memory_mb: Option<u32>,
    disk_gb: Option<u32>,
    bridge: Option<String>,
    hostname: Option<String>,
    ip_address: Option<String>,
    onboot: Option<bool>,
    unprivileged: Option<bool>,
}

impl From<&ReinstallRequest> for Overrides {
    fn from(req: &ReinstallRequest) -> Self {
        Self {
            cores: req.cores,
            memory_mb: req.memory_mb,
            disk_gb: req.disk_gb,
            bridge: req.bridge.clone(),
            hostname: req.hostname.clone(),
            ip_address: req.ip_address.clone(),
            onboot: req.onboot,
            unprivileged: req.unprivileged,
        }
    }
}

impl From<&EditRequest> for Overrides {
    fn from(req: &EditRequest) -> Self {
        Self {
            cores: req.cores,
            memory_mb: req.memory_mb,
            disk_gb: req.disk_gb,
            bridge: req.bridge.clone(),
            hostname: req.hostname.clone(),
            ip_address: req.ip_address.clone(),
            onboot: req.onboot,
            unprivileged: req.unprivileged,
        }
    }
}

impl Overrides {
    fn validate(&self) -> Result<()> {
        validate::resources(self.cores, self.memory_mb, self.disk_gb)?;
        if let Some(bridge) = &self.bridge {
            validate::bridge(bridge)?;
        }
        if let Some(hostname) = &self.hostname {
            validate::hostname(hostname)?;
        }
        if let Some(ip) = &self.ip_address {
            validate::ip_address(ip)?;
        }
        Ok(())
    }

    /// The container plan of `install` with these overrides applied.
    fn apply(self, install: &Install, manifest: &AppManifest) -> ContainerPlan {
        ContainerPlan {
            os_template: manifest.lxc.ostemplate.clone(),
            storage: install.storage.clone(),
            bridge: self.bridge.unwrap_or_else(|| install.bridge.clone()),
            cores: self.cores.unwrap_or(install.cores),
            memory_mb: self.memory_mb.unwrap_or(install.memory_mb),
            disk_gb: self.disk_gb.unwrap_or(install.disk_gb),
            hostname: self.hostname.unwrap_or_else(|| install.hostname.clone()),
            ip_address: self.ip_address.or_else(|| install.ip_address.clone()),
            hw_addr: None,
            onboot: self.onboot.unwrap_or(install.onboot),
            unprivileged: self.unprivileged.unwrap_or(install.unprivileged),
            features: manifest.lxc.defaults.features.clone(),
            tags: container_tags(None),
            mount_points: install.mount_points.clone(),
            devices: install.devices.clone(),
            extra_config: manifest.lxc.extra_config.clone(),
        }
    }
}

pub(crate) fn nonzero(value: u32) -> Option<u32> {
    Some(value).filter(|v| *v > 0)
}

impl<S: EngineServices> EngineInner<S> {
    pub(crate) fn manifest(&self, app_id: &str) -> Result<AppManifest> {
        self.services
            .catalog()
            .get_app(app_id)
            .ok_or_else(|| EngineError::invalid(format!("app {app_id:?} not found in catalog")))
    }

    /// Resolves requested and GPU profile devices against what the host has.
    pub(crate) async fn resolve_devices(
        &self,
        requests: &[DeviceRequest<'_>],
    ) -> Result<Vec<DevicePassthrough>> {
        let host = match self.services.runtime().host_devices().await {
            Ok(host) => host,
            Err(e) => {
                tracing::warn!("Could not list host devices: {e}");
                Vec::new()
            }
        };
        resolver::resolve_devices(requests, &self.config.gpu, |path| {
            host.iter().any(|h| h == path)
        })
        .map_err(EngineError::InvalidRequest)
    }

    /// Builds and provisions a container for `work`. Returns the container and the app's outputs.
    async fn provision_new(
        &self,
        ctx: &Ctx<S>,
        work: &InstallWork,
        plan: &ContainerPlan,
        created: &mut Option<u32>,
    ) -> Result<(crate::pipeline::Container, BTreeMap<String, String>), JobError> {
        let container = self.build_container(ctx, plan, created).await?;
        let app = AppRun {
            manifest: &work.manifest,
            inputs: &work.inputs,
            env_vars: &work.env_vars,
            permissions: &work.manifest.permissions,
            label: "provision",
        };
        let outputs = self.provision_app(ctx, container.ctid, &app).await?;
        Ok((container, outputs))
    }

    async fn run_install(&self, ctx: &Ctx<S>, work: InstallWork) -> Result<(), JobError> {
        ctx.info(format!(
            "Starting install of {} ({})",
            work.manifest.name, work.manifest.id
        ))
        .await;

        ctx.enter(Step::ValidateManifest).await?;
        work.manifest.validate()?;
        ctx.enter(Step::ValidatePlacement).await?;
        self.check_placement(&work.plan)?;

        let mut created = None;
        let (container, outputs) = match self
            .provision_new(ctx, &work, &work.plan, &mut created)
            .await
        {
            Ok(done) => done,
            Err(e) => {
                if let Some(ctid) = created {
                    self.discard_container(ctx, ctid).await;
                }
                return Err(e);
            }
        };

        let plan = work.plan;
        let install = Install {
            id: work.install_id,
            app_id: work.manifest.id.clone(),
            app_name: work.manifest.name.clone(),
            app_version: work.manifest.version.clone(),
            ctid: Some(container.ctid),
            status: InstallStatus::Running,
            storage: plan.storage,
            bridge: plan.bridge,
            cores: plan.cores,
            memory_mb: plan.memory_mb,
            disk_gb: plan.disk_gb,
            hostname: plan.hostname,
            ip_address: plan.ip_address,
            mac_address: container.mac_address,
            onboot: plan.onboot,
            unprivileged: plan.unprivileged,
            inputs: work.inputs,
            outputs,
            mount_points: container.mount_points,
            devices: plan.devices,
            env_vars: work.env_vars,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.put_install(install).await {
            self.discard_container(ctx, container.ctid).await;
            return Err(e).context("saving install");
        }
        ctx.info(format!(
            "Install complete! Container {} is running.",
            container.ctid
        ))
        .await;
        Ok(())
    }

    /// Reinstall, update and edit: replaces the container of an existing install.
    ///
    /// A failure after the old container is gone is not rolled back. The install record
    /// keeps its previous values and the new container, if any, is left for inspection.
    async fn run_recreate(
        &self,
        ctx: &Ctx<S>,
        kind: JobKind,
        work: InstallWork,
    ) -> Result<(), JobError> {
        let _lock = self.store.lock(&work.install_id).await;
        let mut install = self
            .store
            .install(&work.install_id)
            .ok_or_else(|| JobError::failed(format!("install {} no longer exists", work.install_id)))?;

        ctx.info(match kind {
            JobKind::Reinstall => format!(
                "Starting reinstall of {} with {} preserved volume(s)",
                work.manifest.name,
                install.mount_points.iter().filter(|mp| mp.is_volume()).count()
            ),
            JobKind::Update => format!(
                "Starting update of {} from v{} to v{}",
                work.manifest.name, install.app_version, work.manifest.version
            ),
            _ => format!("Starting edit of {}", work.manifest.name),
        })
        .await;

        ctx.enter(Step::ValidateManifest).await?;
        work.manifest.validate()?;
        ctx.enter(Step::ValidatePlacement).await?;
        self.check_placement(&work.plan)?;

        let mut plan = work.plan.clone();
        if kind != JobKind::Reinstall
            && let Some(old) = install.ctid
        {
            ctx.info(format!("Stopping and destroying old container CT {old}..."))
                .await;
            let mac = self
                .teardown_for_recreate(ctx, old, &mut plan.mount_points)
                .await?;
            if kind == JobKind::Edit {
                plan.hw_addr = mac.or_else(|| install.mac_address.clone());
            }
        }

        let mut created = None;
        let (container, outputs) = match self.provision_new(ctx, &work, &plan, &mut created).await {
            Ok(done) => done,
            Err(e) => {
                if let Some(ctid) = created {
                    ctx.warn(format!(
                        "Container {ctid} was left in place; its volumes are still attached"
                    ))
                    .await;
                }
                return Err(e);
            }
        };

        install.ctid = Some(container.ctid);
        install.status = InstallStatus::Running;
        install.bridge = plan.bridge;
        install.cores = plan.cores;
        install.memory_mb = plan.memory_mb;
        install.disk_gb = plan.disk_gb;
        install.hostname = plan.hostname;
        install.ip_address = plan.ip_address;
        install.mac_address = container.mac_address;
        install.onboot = plan.onboot;
        install.unprivileged = plan.unprivileged;
        install.inputs = work.inputs;
        install.outputs = outputs;
        install.mount_points = container.mount_points;
        install.env_vars = work.env_vars;
        if kind != JobKind::Edit {
            install.app_version = work.manifest.version.clone();
        }
        self.store
            .put_install(install)
            .await
            .context("saving install")?;

        ctx.info(match kind {
            JobKind::Reinstall => format!(
                "Reinstall complete! Container {} is running with reattached volumes.",
                container.ctid
            ),
            JobKind::Update => format!(
                "Update complete! {} is now v{} (CT {}).",
                work.manifest.name, work.manifest.version, container.ctid
            ),
            _ => format!(
                "Edit complete! {} CT {} recreated.",
                work.manifest.name, container.ctid
            ),
        })
        .await;
        Ok(())
    }

    async fn run_uninstall(
        &self,
        ctx: &Ctx<S>,
        install_id: &str,
        keep_volumes: bool,
    ) -> Result<(), JobError> {
        let _lock = self.store.lock(install_id).await;
        let mut install = self
            .store
            .install(install_id)
            .ok_or_else(|| JobError::failed(format!("install {install_id} no longer exists")))?;
        let runtime = self.services.runtime();
        let token = ctx.token();

        ctx.info(format!(
            "Starting uninstall of {} (keep volumes: {keep_volumes})",
            install.app_name
        ))
        .await;

        if let Some(ctid) = install.ctid {
            ctx.enter(Step::StopContainer).await?;
            let mut gone = false;
            match runtime.stop(ctid, token).await {
                Ok(()) => ctx.info(format!("Container {ctid} stopped")).await,
                Err(RuntimeError::NotFound(_)) => {
                    ctx.info(format!("Container {ctid} already removed, skipping destroy"))
                        .await;
                    gone = true;
                }
                Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => ctx.warn(format!("Force stop error: {e}")).await,
            }

            let managed: Vec<u32> = install
                .mount_points
                .iter()
                .filter(|mp| mp.is_volume())
                .map(|mp| mp.index)
                .collect();
            if !gone && keep_volumes && !managed.is_empty() {
                ctx.enter(Step::DetachVolumes).await?;
                if let Err(e) = self.refresh_volume_ids(ctid, &mut install.mount_points).await {
                    ctx.warn(format!("Failed to read volume ids: {e}")).await;
                }
                for mp in install.mount_points.iter().filter(|mp| mp.is_volume()) {
                    ctx.info(format!(
                        "Detaching volume {} (mp{}): {}",
                        mp.name,
                        mp.index,
                        mp.volume_id.as_deref().unwrap_or("unknown")
                    ))
                    .await;
                }
                match runtime.detach_mount_points(ctid, &managed, token).await {
                    Ok(()) => {}
                    Err(RuntimeError::NotFound(_)) => gone = true,
                    Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
                    Err(e) => {
                        ctx.warn(format!(
                            "Failed to detach mount points: {e}, volumes may be destroyed"
                        ))
                        .await;
                    }
                }
            }

            if !gone {
                ctx.enter(Step::DestroyContainer).await?;
                ctx.info(format!("Destroying container {ctid}...")).await;
                self.destroy_container(ctx, ctid, keep_volumes, token).await?;
            }
        }

        if keep_volumes && install.has_managed_volumes() {
            let old = install.ctid.take();
            install.status = InstallStatus::Uninstalled;
            self.store
                .put_install(install)
                .await
                .context("saving install")?;
            ctx.info("Install record preserved with managed volume(s)").await;
            if let Some(ctid) = old {
                ctx.info(format!("Uninstall complete. Container {ctid} destroyed."))
                    .await;
            }
        } else {
            self.store
                .remove_install(install_id)
                .await
                .context("deleting install")?;
            ctx.info("Uninstall complete").await;
        }
        Ok(())
    }

    async fn run_reconfigure(
        &self,
        ctx: &Ctx<S>,
        install_id: &str,
        req: &ReconfigureRequest,
        manifest: Option<&AppManifest>,
    ) -> Result<Install, JobError> {
        let _lock = self.store.lock(install_id).await;
        let mut install = self
            .store
            .install(install_id)
            .ok_or_else(|| JobError::failed(format!("install {install_id} no longer exists")))?;
        let ctid = install
            .ctid
            .ok_or_else(|| JobError::failed(format!("install {install_id} has no container")))?;

        let update = ResourceUpdate {
            cores: req.cores.filter(|c| *c != install.cores),
            memory_mb: req.memory_mb.filter(|m| *m != install.memory_mb),
        };
        if update != ResourceUpdate::default() {
            ctx.enter(Step::ApplyResources).await?;
            self.services
                .runtime()
                .update_resources(ctid, update, ctx.token())
                .await
                .context("updating container resources")?;
            install.cores = update.cores.unwrap_or(install.cores);
            install.memory_mb = update.memory_mb.unwrap_or(install.memory_mb);
            ctx.info(format!(
                "Resources set to {} core(s), {} MB",
                install.cores, install.memory_mb
            ))
            .await;
        }

        let mut inputs = install.inputs.clone();
        let mut changed = false;
        for (key, value) in &req.inputs {
            if inputs.get(key) != Some(value) {
                inputs.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        if changed {
            ctx.enter(Step::Configure).await?;
            self.push_inputs(ctid, &inputs, ctx.token()).await?;
            match manifest.filter(|m| !m.provisioning.script.is_empty()) {
                Some(manifest) => {
                    let app = AppRun {
                        manifest,
                        inputs: &inputs,
                        env_vars: &install.env_vars,
                        permissions: &manifest.permissions,
                        label: "configure",
                    };
                    self.run_action(ctx, ctid, &app, actions::CONFIGURE).await?;
                    ctx.info("Configure completed").await;
                }
                None => ctx.info("No provisioning script, inputs pushed only").await,
            }
            install.inputs = inputs;
        }

        self.store
            .put_install(install.clone())
            .await
            .context("saving install")?;
        Ok(install)
    }

    /// Container id of an install that has one.
    fn install_ctid(&self, install_id: &str) -> Result<u32> {
        let install = self
            .store
            .install(install_id)
            .ok_or_else(|| EngineError::not_found("install", install_id))?;
        match install.ctid {
            Some(ctid) if !install.is_uninstalled() => Ok(ctid),
            _ => Err(EngineError::InvalidState(format!(
                "install {install_id} has no active container"
            ))),
        }
    }

    async fn set_install_status(&self, install_id: &str, status: InstallStatus) -> Result<()> {
        let _lock = self.store.lock(install_id).await;
        if let Some(mut install) = self.store.install(install_id)
            && install.status != status
            && !install.is_uninstalled()
        {
            install.status = status;
            self.store.put_install(install).await?;
        }
        Ok(())
    }

    /// Graceful shutdown, then a forced stop if that fails.
    pub(crate) async fn shutdown_or_stop(&self, ctid: u32, cancel: &CancellationToken) -> Result<()> {
        let runtime = self.services.runtime();
        if let Err(e) = runtime
            .shutdown(ctid, self.config.shutdown_timeout(), cancel)
            .await
        {
            tracing::warn!("Graceful shutdown of container {ctid} failed: {e}, forcing stop");
            runtime.stop(ctid, cancel).await?;
        }
        Ok(())
    }

    pub(crate) async fn restart(&self, ctid: u32) -> Result<()> {
        let cancel = CancellationToken::new();
        if let Err(e) = self.shutdown_or_stop(ctid, &cancel).await {
            tracing::warn!("Stop before restart of container {ctid} failed: {e}");
        }
        pause(&cancel, self.config.restart_delay()).await.ok();
        self.services.runtime().start(ctid, &cancel).await?;
        Ok(())
    }
}

impl<S: EngineServices> Engine<S> {
    // ========================================================================
    // Install lifecycle
    // ========================================================================

    /// Validates the request and queues an install job.
    ///
    /// Fails with [`EngineError::Duplicate`] if the app is installed or has an active job.
    pub async fn start_install(&self, req: InstallRequest) -> Result<Job> {
        let inner = &self.inner;
        let manifest = inner.manifest(&req.app_id)?;
        let config = &inner.config;

        validate::resources(req.cores, req.memory_mb, req.disk_gb)?;
        if let Some(hostname) = &req.hostname {
            validate::hostname(hostname)?;
        }
        if let Some(bridge) = &req.bridge {
            validate::bridge(bridge)?;
        }
        if let Some(ip) = &req.ip_address {
            validate::ip_address(ip)?;
        }
        if let Some(tags) = &req.extra_tags {
            validate::tags(tags)?;
        }
        validate::env_vars(&req.env_vars)?;
        validate::devices(&req.devices)?;
        validate::extra_mounts(&req.extra_mounts)?;
        for host_path in req.bind_mounts.values().filter(|hp| !hp.is_empty()) {
            validate::bind_path(host_path)?;
        }
        let inputs = manifest.with_default_inputs(&req.inputs);
        validate::inputs(&manifest, &inputs)?;

        let devices = inner
            .resolve_devices(&[DeviceRequest {
                explicit: &req.devices,
                profile: req.gpu_profile.as_deref(),
                gpu: &manifest.gpu,
            }])
            .await?;

        let storage = req
            .storage
            .clone()
            .unwrap_or_else(|| config.default_storage().to_string());
        let mount_points =
            resolver::install_mounts(&manifest, MountRequest::from_install(&req), &storage);
        for host_path in mount_points.iter().filter_map(|mp| mp.host_path.as_deref()) {
            validate::bind_path(host_path)?;
        }

        let defaults = &manifest.lxc.defaults;
        let plan = ContainerPlan {
            os_template: manifest.lxc.ostemplate.clone(),
            storage,
            bridge: req
                .bridge
                .clone()
                .unwrap_or_else(|| config.default_bridge().to_string()),
            cores: req
                .cores
                .or(nonzero(defaults.cores))
                .unwrap_or(config.defaults.cores),
            memory_mb: req
                .memory_mb
                .or(nonzero(defaults.memory_mb))
                .unwrap_or(config.defaults.memory_mb),
            disk_gb: req
                .disk_gb
                .or(nonzero(defaults.disk_gb))
                .unwrap_or(config.defaults.disk_gb),
            hostname: req.hostname.clone().unwrap_or_else(|| manifest.id.clone()),
            ip_address: req.ip_address.clone(),
            hw_addr: None,
            onboot: req.onboot.unwrap_or(defaults.onboot),
            unprivileged: req.unprivileged.unwrap_or(defaults.unprivileged),
            features: defaults.features.clone(),
            tags: container_tags(req.extra_tags.as_deref()),
            mount_points,
            devices,
            extra_config: manifest.lxc.extra_config.clone(),
        };

        let job = Job::new(JobKind::Install, &manifest.id, &manifest.name);
        let job = {
            let install_id = job.id.clone();
            job.with_install(install_id)
        };
        let app_id = manifest.id.clone();
        let permit = inner.guard.admit(
            GuardKey::App(app_id.clone()),
            &job.id,
            job.kind,
            || {
                if let Some(existing) = inner.store.active_install_for_app(&app_id) {
                    return Some(Duplicate {
                        message: format!(
                            "{app_id} is already installed (install {})",
                            existing.id
                        ),
                        install_id: Some(existing.id),
                        ..Default::default()
                    });
                }
                inner.scheduler.active_for_app(&app_id).map(|active| Duplicate {
                    message: format!(
                        "{app_id} already has an active {} job ({})",
                        active.kind, active.id
                    ),
                    job_id: Some(active.id),
                    ..Default::default()
                })
            },
        )?;
        let job = inner.scheduler.submit(job).await?;

        let work = InstallWork {
            install_id: job.id.clone(),
            manifest,
            plan,
            inputs,
            env_vars: req.env_vars,
        };
        let worker = self.inner.clone();
        inner.scheduler.launch(&job.id, permit, move |ctx| async move {
            worker.run_install(&ctx, work).await
        });
        Ok(job)
    }

    /// Destroys the container of an install.
    ///
    /// With `keep_volumes` managed volumes are detached first and the record is kept as
    /// `uninstalled` so [`Engine::reinstall`] can reattach them.
    pub async fn uninstall(&self, install_id: &str, keep_volumes: bool) -> Result<Job> {
        let inner = &self.inner;
        let install = self.get_install(install_id)?;
        if install.is_uninstalled() {
            return Err(EngineError::InvalidState(format!(
                "install {install_id} is already uninstalled; use purge to remove the record"
            )));
        }
        let job = Job::new(JobKind::Uninstall, &install.app_id, &install.app_name)
            .with_install(install_id)
            .with_ctid(install.ctid);
        let permit = inner.guard.admit(
            GuardKey::App(install.app_id.clone()),
            &job.id,
            job.kind,
            || None,
        )?;
        let job = inner.scheduler.submit(job).await?;

        let worker = self.inner.clone();
        let install_id = install_id.to_string();
        inner.scheduler.launch(&job.id, permit, move |ctx| async move {
            worker.run_uninstall(&ctx, &install_id, keep_volumes).await
        });
        Ok(job)
    }

    /// Deletes the record of an uninstalled install.
    ///
    /// Fails with [`EngineError::Duplicate`] while another operation on the app is active.
    pub async fn purge_install(&self, install_id: &str) -> Result<()> {
        let app_id = self.get_install(install_id)?.app_id;
        // Claimed before the record lock, which a running job holds until it ends.
        let _permit = self.inner.guard.admit(
            GuardKey::App(app_id),
            &format!("purge-{install_id}"),
            JobKind::Uninstall,
            || None,
        )?;
        let _lock = self.inner.store.lock(install_id).await;
        let install = self.get_install(install_id)?;
        if !install.is_uninstalled() {
            return Err(EngineError::InvalidState(format!(
                "can only purge uninstalled records (install {install_id} is {:?})",
                install.status
            )));
        }
        self.inner.store.remove_install(install_id).await?;
        tracing::info!("Purged install {install_id}");
        Ok(())
    }

    /// Provisions a new container for an uninstalled install, reattaching its kept volumes.
    pub async fn reinstall(&self, install_id: &str, req: ReinstallRequest) -> Result<Job> {
        let install = self.get_install(install_id)?;
        if !install.is_uninstalled() {
            return Err(EngineError::InvalidState(format!(
                "install {install_id} is not uninstalled"
            )));
        }
        if install.mount_points.is_empty() {
            return Err(EngineError::InvalidState(format!(
                "install {install_id} has no preserved volumes to reattach"
            )));
        }
        self.start_recreate(
            JobKind::Reinstall,
            install,
            Overrides::from(&req),
            req.inputs,
            req.env_vars,
        )
        .await
    }

    /// Recreates the container of an install with the catalog's newer version.
    pub async fn update(&self, install_id: &str, req: UpdateRequest) -> Result<Job> {
        let install = self.get_install(install_id)?;
        if install.is_uninstalled() {
            return Err(EngineError::InvalidState(format!(
                "install {install_id} is uninstalled; use reinstall instead"
            )));
        }
        let manifest = self.inner.manifest(&install.app_id)?;
        if !is_newer_version(&manifest.version, &install.app_version) {
            return Err(EngineError::InvalidState(format!(
                "no update available: catalog version {} is not newer than installed {}",
                manifest.version, install.app_version
            )));
        }
        self.start_recreate(
            JobKind::Update,
            install,
            Overrides::from(&req),
            req.inputs,
            req.env_vars,
        )
        .await
    }

    /// Recreates the container of an install with changed settings, keeping its MAC address.
    pub async fn edit_install(&self, install_id: &str, req: EditRequest) -> Result<Job> {
        let install = self.get_install(install_id)?;
        if install.is_uninstalled() {
            return Err(EngineError::InvalidState(format!(
                "install {install_id} is uninstalled; cannot edit"
            )));
        }
        if let Some(disk) = req.disk_gb.filter(|d| *d < install.disk_gb) {
            return Err(EngineError::invalid(format!(
                "cannot shrink disk from {} GB to {disk} GB",
                install.disk_gb
            )));
        }
        self.start_recreate(
            JobKind::Edit,
            install,
            Overrides::from(&req),
            req.inputs,
            BTreeMap::new(),
        )
        .await
    }

    async fn start_recreate(
        &self,
        kind: JobKind,
        install: Install,
        overrides: Overrides,
        inputs: BTreeMap<String, String>,
        env_vars: BTreeMap<String, String>,
    ) -> Result<Job> {
        let inner = &self.inner;
        let manifest = inner.manifest(&install.app_id)?;
        overrides.validate()?;
        validate::env_vars(&env_vars)?;

        let mut merged = install.inputs.clone();
        merged.extend(inputs);
        let inputs = manifest.with_default_inputs(&merged);
        validate::inputs(&manifest, &inputs)?;
        let mut all_env = install.env_vars.clone();
        all_env.extend(env_vars);

        let plan = overrides.apply(&install, &manifest);
        let job = Job::new(kind, &install.app_id, &install.app_name)
            .with_install(&install.id)
            .with_ctid(install.ctid);
        let permit = inner.guard.admit(
            GuardKey::App(install.app_id.clone()),
            &job.id,
            kind,
            || {
                inner
                    .store
                    .active_install_for_app(&install.app_id)
                    .filter(|other| other.id != install.id)
                    .map(|other| Duplicate {
                        message: format!(
                            "{} is already installed (install {})",
                            install.app_id, other.id
                        ),
                        install_id: Some(other.id),
                        ..Default::default()
                    })
            },
        )?;
        let job = inner.scheduler.submit(job).await?;

        let work = InstallWork {
            install_id: install.id,
            manifest,
            plan,
            inputs,
            env_vars: all_env,
        };
        let worker = self.inner.clone();
        inner.scheduler.launch(&job.id, permit, move |ctx| async move {
            worker.run_recreate(&ctx, kind, work).await
        });
        Ok(job)
    }

    /// Applies resource and input changes in place and runs the app's configure action.
    ///
    /// Waits for the job before returning. Dropping the returned future does not abort
    /// the job; it keeps running and can be followed with [`Engine::wait_for_job`].
    pub async fn reconfigure_install(
        &self,
        install_id: &str,
        req: ReconfigureRequest,
    ) -> Result<Install> {
        let inner = &self.inner;
        let install = self.get_install(install_id)?;
        if install.is_uninstalled() || install.ctid.is_none() {
            return Err(EngineError::InvalidState(format!(
                "install {install_id} has no active container"
            )));
        }
        validate::resources(req.cores, req.memory_mb, None)?;

        let manifest = inner.services.catalog().get_app(&install.app_id);
        if !req.inputs.is_empty() {
            let Some(manifest) = &manifest else {
                return Err(EngineError::invalid(format!(
                    "app {:?} not found in catalog",
                    install.app_id
                )));
            };
            for (key, value) in &req.inputs {
                if install.inputs.get(key) == Some(value) {
                    continue;
                }
                match manifest.input(key) {
                    Some(spec) if spec.reconfigurable => {}
                    Some(_) => {
                        return Err(EngineError::invalid(format!(
                            "input {key:?} cannot be changed without recreating the container"
                        )));
                    }
                    None => return Err(EngineError::invalid(format!("unknown input {key:?}"))),
                }
            }
            let mut merged = install.inputs.clone();
            merged.extend(req.inputs.clone());
            validate::inputs(manifest, &merged)?;
        }

        let job = Job::new(JobKind::Reconfigure, &install.app_id, &install.app_name)
            .with_install(install_id)
            .with_ctid(install.ctid);
        let permit = inner.guard.admit(
            GuardKey::App(install.app_id.clone()),
            &job.id,
            job.kind,
            || None,
        )?;
        let job = inner.scheduler.submit(job).await?;

        let (tx, rx) = oneshot::channel();
        let worker = self.inner.clone();
        let id = install_id.to_string();
        inner.scheduler.launch(&job.id, permit, move |ctx| async move {
            let install = worker
                .run_reconfigure(&ctx, &id, &req, manifest.as_ref())
                .await?;
            // The caller may be gone.
            let _ = tx.send(install);
            Ok(())
        });

        let done = inner.scheduler.wait(&job.id).await?;
        match done.state {
            JobState::Completed => rx
                .await
                .map_err(|_| EngineError::Execution("reconfigure produced no install".into())),
            JobState::Cancelled => Err(EngineError::Runtime(RuntimeError::Cancelled)),
            _ => Err(EngineError::Execution(
                done.error
                    .unwrap_or_else(|| format!("reconfigure job {} failed", done.id)),
            )),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_install(&self, install_id: &str) -> Result<Install> {
        self.inner
            .store
            .install(install_id)
            .ok_or_else(|| EngineError::not_found("install", install_id))
    }

    pub async fn get_install_detail(&self, install_id: &str) -> Result<InstallDetail> {
        let install = self.get_install(install_id)?;
        Ok(self.inner.enrich_install(install).await)
    }

    /// All installs, newest first.
    pub fn list_installs(&self) -> Vec<Install> {
        self.inner.store.installs()
    }

    // ========================================================================
    // Power
    // ========================================================================

    pub async fn start_container(&self, install_id: &str) -> Result<()> {
        let ctid = self.inner.install_ctid(install_id)?;
        self.inner
            .services
            .runtime()
            .start(ctid, &CancellationToken::new())
            .await?;
        self.inner
            .set_install_status(install_id, InstallStatus::Running)
            .await
    }

    /// Graceful shutdown.
    pub async fn stop_container(&self, install_id: &str) -> Result<()> {
        let ctid = self.inner.install_ctid(install_id)?;
        self.inner
            .services
            .runtime()
            .shutdown(ctid, self.inner.config.shutdown_timeout(), &CancellationToken::new())
            .await?;
        self.inner
            .set_install_status(install_id, InstallStatus::Stopped)
            .await
    }

    pub async fn restart_container(&self, install_id: &str) -> Result<()> {
        let ctid = self.inner.install_ctid(install_id)?;
        self.inner.restart(ctid).await?;
        self.inner
            .set_install_status(install_id, InstallStatus::Running)
            .await
    }
}
