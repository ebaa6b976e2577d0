//! Stacks: several apps provisioned in order into one shared container.

use crate::{
    engine::{Ctx, Engine, EngineInner},
    guard::GuardKey,
    install::nonzero,
    pipeline::{AppRun, Container, ContainerPlan, Step, container_tags},
    resolver::{self, DeviceRequest, MountRequest},
    scheduler::{JobError, JobResultExt},
    validate,
};
use corral_core::prelude::*;

use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;

/// The outcome of checking a stack request, shared by validation and admission.
struct StackAssessment {
    /// Manifests of the requested apps that exist, in request order.
    manifests: Vec<AppManifest>,
    mount_points: Vec<MountPoint>,
    report: StackValidation,
}

struct StackWork {
    /// The record written once the container is up. `ctid` and `mac_address` are filled in then.
    stack: Stack,
    /// One manifest per entry of `stack.apps`, same order.
    manifests: Vec<AppManifest>,
    plan: ContainerPlan,
}

fn reason(e: EngineError) -> String {
    match e {
        EngineError::InvalidRequest(msg) => msg,
        other => other.to_string(),
    }
}

fn note(errors: &mut Vec<String>, result: Result<()>) {
    if let Err(e) = result {
        errors.push(reason(e));
    }
}

fn union(into: &mut Vec<String>, from: &[String]) {
    for v in from {
        if !into.contains(v) {
            into.push(v.clone());
        }
    }
}

impl<S: EngineServices> EngineInner<S> {
    fn assess_stack(&self, req: &StackCreateRequest) -> StackAssessment {
        let mut errors = Vec::new();

        if req.name.trim().is_empty() {
            note(&mut errors, Err(EngineError::invalid("stack name is required")));
        }
        if req.apps.is_empty() {
            note(&mut errors, Err(EngineError::invalid("at least one app is required")));
        }
        note(&mut errors, validate::resources(req.cores, req.memory_mb, req.disk_gb));
        if let Some(hostname) = &req.hostname {
            note(&mut errors, validate::hostname(hostname));
        }
        if let Some(bridge) = &req.bridge {
            note(&mut errors, validate::bridge(bridge));
        }
        if let Some(ip) = &req.ip_address {
            note(&mut errors, validate::ip_address(ip));
        }
        note(&mut errors, validate::env_vars(&req.env_vars));
        note(&mut errors, validate::devices(&req.devices));
        note(&mut errors, validate::extra_mounts(&req.extra_mounts));

        let catalog = self.services.catalog();
        let mut seen = HashSet::new();
        let mut manifests: Vec<AppManifest> = Vec::new();
        let mut os_template: Option<(String, String)> = None;
        for app in &req.apps {
            if !seen.insert(app.app_id.as_str()) {
                note(&mut errors, Err(EngineError::invalid(format!(
                    "app {:?} is listed more than once",
                    app.app_id
                ))));
                continue;
            }
            let Some(manifest) = catalog.get_app(&app.app_id) else {
                note(&mut errors, Err(EngineError::invalid(format!(
                    "app {:?} not found in catalog",
                    app.app_id
                ))));
                continue;
            };
            match &os_template {
                None => os_template = Some((manifest.lxc.ostemplate.clone(), manifest.id.clone())),
                Some((template, owner)) if *template != manifest.lxc.ostemplate => {
                    note(&mut errors, Err(EngineError::invalid(format!(
                        "OS template conflict: {} requires {:?} but {owner} requires {template:?}",
                        manifest.id, manifest.lxc.ostemplate
                    ))));
                }
                Some(_) => {}
            }
            let inputs = manifest.with_default_inputs(&app.inputs);
            if let Err(e) = validate::inputs(&manifest, &inputs) {
                errors.push(format!("{}: {}", manifest.id, reason(e)));
            }
            manifests.push(manifest);
        }

        let defaults = &self.config.defaults;
        let mut recommended = RecommendedResources {
            cores: defaults.cores,
            memory_mb: 0,
            disk_gb: 0,
        };
        for m in &manifests {
            let d = &m.lxc.defaults;
            recommended.cores = recommended.cores.max(nonzero(d.cores).unwrap_or(defaults.cores));
            recommended.memory_mb += nonzero(d.memory_mb).unwrap_or(defaults.memory_mb);
            recommended.disk_gb += nonzero(d.disk_gb).unwrap_or(defaults.disk_gb);
        }
        if manifests.is_empty() {
            recommended.memory_mb = defaults.memory_mb;
            recommended.disk_gb = defaults.disk_gb;
        }

        let storage = req
            .storage
            .clone()
            .unwrap_or_else(|| self.config.default_storage().to_string());
        let (mount_points, warnings) =
            resolver::stack_mounts(&manifests, MountRequest::from_stack(req), &storage);
        for host_path in mount_points.iter().filter_map(|mp| mp.host_path.as_deref()) {
            if let Err(e) = validate::bind_path(host_path) {
                errors.push(reason(e));
            }
        }

        StackAssessment {
            manifests,
            mount_points,
            report: StackValidation {
                valid: errors.is_empty(),
                errors,
                warnings,
                recommended,
                os_template: os_template.map(|(template, _)| template),
            },
        }
    }

    /// Provisions each app in order. A failed app is recorded and the next one proceeds.
    ///
    /// Returns how many apps completed. Only cancellation aborts.
    async fn provision_stack_apps(
        &self,
        ctx: &Ctx<S>,
        ctid: u32,
        apps: &mut [StackApp],
        manifests: &[AppManifest],
        env_vars: &BTreeMap<String, String>,
    ) -> Result<usize, JobError> {
        let mut permissions = PermissionsSpec::default();
        for m in manifests {
            permissions.merge(&m.permissions);
        }

        let total = apps.len();
        let mut completed = 0;
        for (i, (app, manifest)) in apps.iter_mut().zip(manifests).enumerate() {
            ctx.info(format!("[{}/{total}] Provisioning {}...", i + 1, app.app_name))
                .await;
            app.status = StackAppStatus::Provisioning;
            app.error = None;
            app.outputs.clear();
            let run = AppRun {
                manifest,
                inputs: &app.inputs,
                env_vars,
                permissions: &permissions,
                label: &app.app_id,
            };
            match self.provision_app(ctx, ctid, &run).await {
                Ok(outputs) => {
                    app.status = StackAppStatus::Completed;
                    app.outputs = outputs;
                    completed += 1;
                    ctx.info(format!(
                        "[{}/{total}] {}: provisioning completed",
                        i + 1,
                        app.app_name
                    ))
                    .await;
                }
                Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                Err(JobError::Failed(msg)) => {
                    ctx.warn(format!(
                        "[{}/{total}] {}: {msg}, continuing",
                        i + 1,
                        app.app_name
                    ))
                    .await;
                    app.status = StackAppStatus::Failed;
                    app.error = Some(msg);
                }
            }
        }
        Ok(completed)
    }

    async fn build_stack(
        &self,
        ctx: &Ctx<S>,
        plan: &ContainerPlan,
        apps: &mut [StackApp],
        manifests: &[AppManifest],
        env_vars: &BTreeMap<String, String>,
        created: &mut Option<u32>,
    ) -> Result<(Container, usize), JobError> {
        let container = self.build_container(ctx, plan, created).await?;
        let completed = self
            .provision_stack_apps(ctx, container.ctid, apps, manifests, env_vars)
            .await?;
        Ok((container, completed))
    }

    async fn run_stack_install(&self, ctx: &Ctx<S>, work: StackWork) -> Result<(), JobError> {
        let StackWork {
            mut stack,
            manifests,
            plan,
        } = work;
        ctx.info(format!(
            "Starting stack install of {} with {} app(s)",
            stack.name,
            stack.apps.len()
        ))
        .await;

        ctx.enter(Step::ValidateManifest).await?;
        for m in &manifests {
            m.validate().context(format!("manifest of {}", m.id))?;
        }
        ctx.enter(Step::ValidatePlacement).await?;
        self.check_placement(&plan)?;

        let mut created = None;
        let provisioned = self
            .build_stack(ctx, &plan, &mut stack.apps, &manifests, &stack.env_vars, &mut created)
            .await;
        let (container, completed) = match provisioned {
            Ok(done) => done,
            Err(e) => {
                if let Some(ctid) = created {
                    self.discard_container(ctx, ctid).await;
                }
                return Err(e);
            }
        };

        stack.ctid = Some(container.ctid);
        stack.mac_address = container.mac_address;
        stack.mount_points = container.mount_points;
        stack.status = InstallStatus::Running;
        stack.created_at = Utc::now();
        let total = stack.apps.len();
        if let Err(e) = self.store.put_stack(stack).await {
            self.discard_container(ctx, container.ctid).await;
            return Err(e).context("saving stack");
        }
        ctx.info(format!(
            "Stack install complete! {completed}/{total} apps provisioned. Container {} is running.",
            container.ctid
        ))
        .await;
        Ok(())
    }

    /// Replaces the container of a stack and provisions every app again from its stored inputs.
    ///
    /// Like install recreates, a failure after teardown is not rolled back.
    async fn run_stack_edit(&self, ctx: &Ctx<S>, work: StackWork) -> Result<(), JobError> {
        let StackWork {
            stack: edited,
            manifests,
            mut plan,
        } = work;
        let _lock = self.store.lock(&edited.id).await;
        let Some(mut stack) = self.store.stack(&edited.id) else {
            return Err(JobError::failed(format!("stack {} no longer exists", edited.id)));
        };
        ctx.info(format!(
            "Starting edit of stack {} ({} app(s))",
            stack.name,
            stack.apps.len()
        ))
        .await;

        ctx.enter(Step::ValidateManifest).await?;
        for m in &manifests {
            m.validate().context(format!("manifest of {}", m.id))?;
        }
        ctx.enter(Step::ValidatePlacement).await?;
        self.check_placement(&plan)?;

        if let Some(old) = stack.ctid {
            ctx.info(format!("Stopping and destroying old container CT {old}..."))
                .await;
            let mac = self
                .teardown_for_recreate(ctx, old, &mut plan.mount_points)
                .await?;
            plan.hw_addr = mac.or_else(|| stack.mac_address.clone());
        }

        let mut apps = edited.apps;
        for app in &mut apps {
            app.status = StackAppStatus::Pending;
        }
        let mut created = None;
        let provisioned = self
            .build_stack(ctx, &plan, &mut apps, &manifests, &stack.env_vars, &mut created)
            .await;
        let (container, completed) = match provisioned {
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

        let total = apps.len();
        stack.ctid = Some(container.ctid);
        stack.mac_address = container.mac_address;
        stack.mount_points = container.mount_points;
        stack.status = InstallStatus::Running;
        stack.bridge = plan.bridge;
        stack.cores = plan.cores;
        stack.memory_mb = plan.memory_mb;
        stack.disk_gb = plan.disk_gb;
        stack.hostname = plan.hostname;
        stack.ip_address = plan.ip_address;
        stack.onboot = plan.onboot;
        stack.unprivileged = plan.unprivileged;
        stack.apps = apps;
        self.store.put_stack(stack).await.context("saving stack")?;
        ctx.info(format!(
            "Stack edit complete! {completed}/{total} apps provisioned. Container {} is running.",
            container.ctid
        ))
        .await;
        Ok(())
    }

    async fn run_stack_uninstall(&self, ctx: &Ctx<S>, stack_id: &str) -> Result<(), JobError> {
        let _lock = self.store.lock(stack_id).await;
        let Some(stack) = self.store.stack(stack_id) else {
            return Err(JobError::failed(format!("stack {stack_id} no longer exists")));
        };
        let runtime = self.services.runtime();
        let token = ctx.token();
        ctx.info(format!("Starting uninstall of stack {}", stack.name))
            .await;

        if let Some(ctid) = stack.ctid {
            ctx.enter(Step::StopContainer).await?;
            let mut gone = false;
            match runtime
                .shutdown(ctid, self.config.shutdown_timeout(), token)
                .await
            {
                Ok(()) => {}
                Err(RuntimeError::NotFound(_)) => gone = true,
                Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => {
                    ctx.warn(format!("Graceful shutdown failed: {e}, forcing stop"))
                        .await;
                    match runtime.stop(ctid, token).await {
                        Ok(()) => {}
                        Err(RuntimeError::NotFound(_)) => gone = true,
                        Err(RuntimeError::Cancelled) => return Err(JobError::Cancelled),
                        Err(e) => ctx.warn(format!("Force stop error: {e}")).await,
                    }
                }
            }

            if gone {
                ctx.info(format!("Container {ctid} already removed, skipping destroy"))
                    .await;
            } else {
                ctx.enter(Step::DestroyContainer).await?;
                self.destroy_container(ctx, ctid, false, token).await?;
                ctx.info(format!("Container {ctid} destroyed")).await;
            }
        }

        self.store
            .remove_stack(stack_id)
            .await
            .context("deleting stack")?;
        ctx.info(format!("Stack {} uninstalled", stack.name)).await;
        Ok(())
    }

    fn stack_ctid(&self, stack_id: &str) -> Result<u32> {
        let stack = self
            .store
            .stack(stack_id)
            .ok_or_else(|| EngineError::not_found("stack", stack_id))?;
        match stack.ctid {
            Some(ctid) if stack.status != InstallStatus::Uninstalled => Ok(ctid),
            _ => Err(EngineError::InvalidState(format!(
                "stack {stack_id} has no active container"
            ))),
        }
    }

    async fn set_stack_status(&self, stack_id: &str, status: InstallStatus) -> Result<()> {
        let _lock = self.store.lock(stack_id).await;
        if let Some(mut stack) = self.store.stack(stack_id)
            && stack.status != status
        {
            stack.status = status;
            self.store.put_stack(stack).await?;
        }
        Ok(())
    }
}

impl<S: EngineServices> Engine<S> {
    // ========================================================================
    // Stack lifecycle
    // ========================================================================

    /// Checks a stack request without creating anything.
    pub fn validate_stack(&self, req: &StackCreateRequest) -> StackValidation {
        self.inner.assess_stack(req).report
    }

    /// Validates the request and queues a stack install job.
    pub async fn start_stack(&self, req: StackCreateRequest) -> Result<Job> {
        let inner = &self.inner;
        let StackAssessment {
            manifests,
            mount_points,
            report,
        } = inner.assess_stack(&req);
        if !report.valid {
            return Err(EngineError::invalid(report.errors.join("; ")));
        }
        let recommended = report.recommended;
        let config = &inner.config;

        let mut explicit = Some(req.devices.as_slice());
        let device_requests: Vec<DeviceRequest<'_>> = manifests
            .iter()
            .map(|m| DeviceRequest {
                explicit: explicit.take().unwrap_or_default(),
                profile: None,
                gpu: &m.gpu,
            })
            .collect();
        let devices = inner.resolve_devices(&device_requests).await?;

        let mut features = Vec::new();
        let mut extra_config = Vec::new();
        for m in &manifests {
            union(&mut features, &m.lxc.defaults.features);
            union(&mut extra_config, &m.lxc.extra_config);
        }

        let name = req.name.trim().to_string();
        let plan = ContainerPlan {
            os_template: report.os_template.unwrap_or_default(),
            storage: req
                .storage
                .clone()
                .unwrap_or_else(|| config.default_storage().to_string()),
            bridge: req
                .bridge
                .clone()
                .unwrap_or_else(|| config.default_bridge().to_string()),
            cores: req.cores.unwrap_or(recommended.cores),
            memory_mb: req.memory_mb.unwrap_or(recommended.memory_mb),
            disk_gb: req.disk_gb.unwrap_or(recommended.disk_gb),
            hostname: req
                .hostname
                .clone()
                .unwrap_or_else(|| name.replace(' ', "-")),
            ip_address: req.ip_address.clone(),
            hw_addr: None,
            onboot: req.onboot.unwrap_or(true),
            unprivileged: req.unprivileged.unwrap_or(true),
            features,
            tags: container_tags(Some("stack")),
            mount_points,
            devices,
            extra_config,
        };

        let apps: Vec<StackApp> = req
            .apps
            .iter()
            .zip(&manifests)
            .enumerate()
            .map(|(i, (app, manifest))| StackApp {
                app_id: manifest.id.clone(),
                app_name: manifest.name.clone(),
                app_version: manifest.version.clone(),
                order: i as u32,
                inputs: manifest.with_default_inputs(&app.inputs),
                outputs: BTreeMap::new(),
                status: StackAppStatus::Pending,
                error: None,
            })
            .collect();

        let stack = Stack {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.clone(),
            ctid: None,
            status: InstallStatus::Running,
            os_template: plan.os_template.clone(),
            storage: plan.storage.clone(),
            bridge: plan.bridge.clone(),
            cores: plan.cores,
            memory_mb: plan.memory_mb,
            disk_gb: plan.disk_gb,
            hostname: plan.hostname.clone(),
            ip_address: plan.ip_address.clone(),
            mac_address: None,
            onboot: plan.onboot,
            unprivileged: plan.unprivileged,
            apps,
            mount_points: Vec::new(),
            devices: plan.devices.clone(),
            env_vars: req.env_vars.clone(),
            created_at: Utc::now(),
        };

        let job = Job::new(JobKind::StackInstall, &stack.id, &name).with_stack(&stack.id);
        let permit = inner.guard.admit(
            GuardKey::StackName(name.clone()),
            &job.id,
            job.kind,
            || {
                inner.store.active_stack_named(&name).map(|existing| Duplicate {
                    message: format!("a stack named {name:?} already exists ({})", existing.id),
                    stack_id: Some(existing.id),
                    ..Default::default()
                })
            },
        )?;
        let job = inner.scheduler.submit(job).await?;

        let work = StackWork {
            stack,
            manifests,
            plan,
        };
        let worker = self.inner.clone();
        inner.scheduler.launch(&job.id, permit, move |ctx| async move {
            worker.run_stack_install(&ctx, work).await
        });
        Ok(job)
    }

    /// Destroys a stack's container and deletes its record.
    pub async fn uninstall_stack(&self, stack_id: &str) -> Result<Job> {
        let inner = &self.inner;
        let stack = self.get_stack(stack_id)?;
        let job = Job::new(JobKind::StackUninstall, &stack.id, &stack.name)
            .with_stack(&stack.id)
            .with_ctid(stack.ctid);
        let permit = inner.guard.admit(
            GuardKey::Stack(stack.id.clone()),
            &job.id,
            job.kind,
            || None,
        )?;
        let job = inner.scheduler.submit(job).await?;

        let worker = self.inner.clone();
        let stack_id = stack.id;
        inner.scheduler.launch(&job.id, permit, move |ctx| async move {
            worker.run_stack_uninstall(&ctx, &stack_id).await
        });
        Ok(job)
    }

    /// Recreates a stack's container with changed settings, keeping its MAC address.
    ///
    /// Input changes in `req` are ignored; every app is provisioned with its stored inputs.
    pub async fn edit_stack(&self, stack_id: &str, req: EditRequest) -> Result<Job> {
        let inner = &self.inner;
        let stack = self.get_stack(stack_id)?;
        if stack.status == InstallStatus::Uninstalled {
            return Err(EngineError::InvalidState(format!(
                "stack {stack_id} is uninstalled; cannot edit"
            )));
        }
        if let Some(disk) = req.disk_gb.filter(|d| *d < stack.disk_gb) {
            return Err(EngineError::invalid(format!(
                "cannot shrink disk from {} GB to {disk} GB",
                stack.disk_gb
            )));
        }
        validate::resources(req.cores, req.memory_mb, req.disk_gb)?;
        if let Some(bridge) = &req.bridge {
            validate::bridge(bridge)?;
        }
        if let Some(hostname) = &req.hostname {
            validate::hostname(hostname)?;
        }
        if let Some(ip) = &req.ip_address {
            validate::ip_address(ip)?;
        }

        let mut manifests = Vec::with_capacity(stack.apps.len());
        let mut apps = stack.apps.clone();
        apps.sort_by_key(|a| a.order);
        for app in &mut apps {
            let manifest = inner.manifest(&app.app_id)?;
            app.app_name = manifest.name.clone();
            app.app_version = manifest.version.clone();
            manifests.push(manifest);
        }

        let mut features = Vec::new();
        let mut extra_config = Vec::new();
        for m in &manifests {
            union(&mut features, &m.lxc.defaults.features);
            union(&mut extra_config, &m.lxc.extra_config);
        }
        let plan = ContainerPlan {
            os_template: stack.os_template.clone(),
            storage: stack.storage.clone(),
            bridge: req.bridge.clone().unwrap_or_else(|| stack.bridge.clone()),
            cores: req.cores.unwrap_or(stack.cores),
            memory_mb: req.memory_mb.unwrap_or(stack.memory_mb),
            disk_gb: req.disk_gb.unwrap_or(stack.disk_gb),
            hostname: req.hostname.clone().unwrap_or_else(|| stack.hostname.clone()),
            ip_address: req.ip_address.clone().or_else(|| stack.ip_address.clone()),
            hw_addr: None,
            onboot: req.onboot.unwrap_or(stack.onboot),
            unprivileged: req.unprivileged.unwrap_or(stack.unprivileged),
            features,
            tags: container_tags(Some("stack")),
            mount_points: stack.mount_points.clone(),
            devices: stack.devices.clone(),
            extra_config,
        };

        let job = Job::new(JobKind::StackEdit, &stack.id, &stack.name)
            .with_stack(&stack.id)
            .with_ctid(stack.ctid);
        let permit = inner.guard.admit(
            GuardKey::Stack(stack.id.clone()),
            &job.id,
            job.kind,
            || None,
        )?;
        let job = inner.scheduler.submit(job).await?;

        let work = StackWork {
            stack: Stack { apps, ..stack },
            manifests,
            plan,
        };
        let worker = self.inner.clone();
        inner.scheduler.launch(&job.id, permit, move |ctx| async move {
            worker.run_stack_edit(&ctx, work).await
        });
        Ok(job)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_stack(&self, stack_id: &str) -> Result<Stack> {
        self.inner
            .store
            .stack(stack_id)
            .ok_or_else(|| EngineError::not_found("stack", stack_id))
    }

    pub async fn get_stack_detail(&self, stack_id: &str) -> Result<StackDetail> {
        let stack = self.get_stack(stack_id)?;
        Ok(self.inner.enrich_stack(stack).await)
    }

    /// All stacks, newest first.
    pub fn list_stacks(&self) -> Vec<Stack> {
        self.inner.store.stacks()
    }

    // ========================================================================
    // Power
    // ========================================================================

    pub async fn start_stack_container(&self, stack_id: &str) -> Result<()> {
        let ctid = self.inner.stack_ctid(stack_id)?;
        self.inner
            .services
            .runtime()
            .start(ctid, &CancellationToken::new())
            .await?;
        self.inner
            .set_stack_status(stack_id, InstallStatus::Running)
            .await
    }

    /// Graceful shutdown.
    pub async fn stop_stack_container(&self, stack_id: &str) -> Result<()> {
        let ctid = self.inner.stack_ctid(stack_id)?;
        self.inner
            .services
            .runtime()
            .shutdown(ctid, self.inner.config.shutdown_timeout(), &CancellationToken::new())
            .await?;
        self.inner
            .set_stack_status(stack_id, InstallStatus::Stopped)
            .await
    }

    pub async fn restart_stack_container(&self, stack_id: &str) -> Result<()> {
        let ctid = self.inner.stack_ctid(stack_id)?;
        self.inner.restart(ctid).await?;
        self.inner
            .set_stack_status(stack_id, InstallStatus::Running)
            .await
    }
}
