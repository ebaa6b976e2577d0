//! The engine facade and its builder.

use crate::{
    config::EngineConfig,
    guard::DuplicateGuard,
    recipe::{ApplyResult, ExportBundle, InstallRecipe, StackRecipe},
    scheduler::{JobContext, JobScheduler},
    store::EntityStore,
};
use corral_core::prelude::*;

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) type Ctx<S> = JobContext<<S as EngineServices>::Backend>;

/// Shared state behind every [`Engine`] handle and every worker.
pub(crate) struct EngineInner<S: EngineServices> {
    pub(crate) config: EngineConfig,
    pub(crate) services: S,
    pub(crate) store: EntityStore<S::Backend>,
    pub(crate) scheduler: Arc<JobScheduler<S::Backend>>,
    pub(crate) guard: Arc<DuplicateGuard>,
    /// Serializes container id allocation with container creation.
    pub(crate) ctid_lock: Arc<tokio::sync::Mutex<()>>,
}

/// The builder for an [`Engine`].
#[derive(Clone, Debug, Default)]
pub struct Corral {
    config: EngineConfig,
}

impl Corral {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Validates the configuration, loads persisted state and recovers jobs a
    /// previous process left unfinished.
    pub async fn build<S: EngineServices>(self, services: S) -> Result<Engine<S>> {
        self.config.validate()?;
        let snapshot = services.backend().load().await?;
        tracing::info!(
            "Loaded {} job(s), {} install(s), {} stack(s)",
            snapshot.jobs.len(),
            snapshot.installs.len(),
            snapshot.stacks.len()
        );

        let store = EntityStore::new(services.backend().clone());
        store.restore(snapshot.installs, snapshot.stacks);
        let scheduler = JobScheduler::new(
            services.backend().clone(),
            self.config.max_concurrent_jobs,
        );
        let interrupted = scheduler.restore(snapshot.jobs, snapshot.logs).await;

        let inner = Arc::new(EngineInner {
            config: self.config,
            services,
            store,
            scheduler,
            guard: DuplicateGuard::new(),
            ctid_lock: Arc::new(tokio::sync::Mutex::new(())),
        });
        inner.recover_orphans(&interrupted).await;
        Ok(Engine { inner })
    }
}

impl<S: EngineServices> EngineInner<S> {
    /// Removes containers that interrupted jobs created but no record owns.
    async fn recover_orphans(&self, interrupted: &[Job]) {
        let owned = self.store.referenced_ctids();
        let runtime = self.services.runtime();
        let cancel = CancellationToken::new();
        for job in interrupted.iter().filter(|j| j.kind.creates_container()) {
            let Some(ctid) = job.ctid.filter(|c| !owned.contains(c)) else {
                continue;
            };
            tracing::warn!("Removing container {ctid} orphaned by job {}", job.id);
            if let Err(e) = runtime.stop(ctid, &cancel).await
                && !matches!(e, RuntimeError::NotFound(_))
            {
                tracing::debug!("Stop of orphaned container {ctid} failed: {e}");
            }
            match runtime.destroy(ctid, false, &cancel).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {
                    self.scheduler
                        .log(
                            &job.id,
                            LogLevel::Warn,
                            format!("Orphaned container {ctid} destroyed"),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::error!("Failed to destroy orphaned container {ctid}: {e}");
                }
            }
        }
    }

    async fn live_status(&self, ctid: Option<u32>) -> (Option<ContainerStatusDetail>, Option<String>) {
        let Some(ctid) = ctid else {
            return (None, None);
        };
        let runtime = self.services.runtime();
        let (status, ip) = tokio::join!(runtime.status(ctid), runtime.ip_address(ctid));
        let status = status
            .inspect_err(|e| tracing::debug!("Status of container {ctid} unavailable: {e}"))
            .ok();
        (status, ip.ok().flatten())
    }

    pub(crate) async fn enrich_install(&self, mut install: Install) -> InstallDetail {
        let (live, ip) = self.live_status(install.ctid).await;
        if let Some(status) = live.as_ref().and_then(|l| observed_status(l.state)) {
            install.status = status;
        }
        let catalog_version = self
            .services
            .catalog()
            .get_app(&install.app_id)
            .map(|m| m.version);
        let update_available = catalog_version
            .as_deref()
            .is_some_and(|v| !install.is_uninstalled() && is_newer_version(v, &install.app_version));
        Enriched {
            uptime_secs: live.as_ref().map(|l| l.uptime_secs),
            live,
            ip,
            catalog_version,
            update_available,
            record: install,
        }
    }

    pub(crate) async fn enrich_stack(&self, mut stack: Stack) -> StackDetail {
        let (live, ip) = self.live_status(stack.ctid).await;
        if let Some(status) = live.as_ref().and_then(|l| observed_status(l.state)) {
            stack.status = status;
        }
        Enriched {
            uptime_secs: live.as_ref().map(|l| l.uptime_secs),
            live,
            ip,
            ..Enriched::bare(stack)
        }
    }
}

fn observed_status(state: ContainerState) -> Option<InstallStatus> {
    match state {
        ContainerState::Running => Some(InstallStatus::Running),
        ContainerState::Stopped => Some(InstallStatus::Stopped),
        ContainerState::Unknown => None,
    }
}

/// A handle to a running engine. Cheap to clone.
pub struct Engine<S: EngineServices> {
    pub(crate) inner: Arc<EngineInner<S>>,
}

impl<S: EngineServices> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: EngineServices> Engine<S> {
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn services(&self) -> &S {
        &self.inner.services
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.inner.scheduler.list()
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.inner
            .scheduler
            .get(id)
            .ok_or_else(|| EngineError::not_found("job", id))
    }

    pub async fn cancel_job(&self, id: &str) -> Result<Job> {
        self.inner.scheduler.cancel(id).await
    }

    /// Deletes terminal jobs and their logs. Returns how many were removed.
    pub async fn clear_jobs(&self) -> usize {
        self.inner.scheduler.clear().await
    }

    /// Entries with an id greater than `after_id`, and the id to poll from next.
    pub async fn logs_since(&self, job_id: &str, after_id: u64) -> (Vec<LogEntry>, u64) {
        self.inner.scheduler.logs_since(job_id, after_id).await
    }

    pub async fn logs(&self, job_id: &str) -> Vec<LogEntry> {
        self.inner.scheduler.logs(job_id).await
    }

    /// Resolves once the job is terminal.
    pub async fn wait_for_job(&self, id: &str) -> Result<Job> {
        self.inner.scheduler.wait(id).await
    }

    pub fn has_active_install_for_app(&self, app_id: &str) -> Option<Install> {
        self.inner.store.active_install_for_app(app_id)
    }

    pub fn has_active_job_for_app(&self, app_id: &str) -> Option<Job> {
        self.inner.scheduler.active_for_app(app_id)
    }

    // ========================================================================
    // Export
    // ========================================================================

    pub fn export_install(&self, id: &str) -> Result<InstallRecipe> {
        let install = self
            .inner
            .store
            .install(id)
            .ok_or_else(|| EngineError::not_found("install", id))?;
        let manifest = self.inner.services.catalog().get_app(&install.app_id);
        Ok(InstallRecipe::from_install(&install, manifest.as_ref()))
    }

    pub fn export_stack(&self, id: &str) -> Result<StackRecipe> {
        let stack = self
            .inner
            .store
            .stack(id)
            .ok_or_else(|| EngineError::not_found("stack", id))?;
        Ok(StackRecipe::from_stack(&stack))
    }

    /// Recipes of every install that still has a container, and of every stack.
    pub fn export_all(&self) -> ExportBundle {
        let catalog = self.inner.services.catalog();
        let installs = self
            .inner
            .store
            .installs()
            .iter()
            .filter(|i| !i.is_uninstalled())
            .map(|i| InstallRecipe::from_install(i, catalog.get_app(&i.app_id).as_ref()))
            .collect();
        let stacks = self
            .inner
            .store
            .stacks()
            .iter()
            .map(StackRecipe::from_stack)
            .collect();
        ExportBundle {
            exported_at: Utc::now(),
            installs,
            stacks,
        }
    }

    /// Starts one job per recipe. A rejected recipe does not stop the others.
    pub async fn apply_bundle(&self, bundle: ExportBundle) -> Vec<ApplyResult> {
        let mut results = Vec::with_capacity(bundle.installs.len() + bundle.stacks.len());
        for recipe in bundle.installs {
            let target = recipe.app_id.clone();
            results.push(match self.start_install(recipe.into_request()).await {
                Ok(job) => ApplyResult {
                    target,
                    job_id: Some(job.id),
                    error: None,
                },
                Err(e) => ApplyResult {
                    target,
                    job_id: None,
                    error: Some(e.to_string()),
                },
            });
        }
        for recipe in bundle.stacks {
            let target = recipe.name.clone();
            results.push(match self.start_stack(recipe.into_request()).await {
                Ok(job) => ApplyResult {
                    target,
                    job_id: Some(job.id),
                    error: None,
                },
                Err(e) => ApplyResult {
                    target,
                    job_id: None,
                    error: Some(e.to_string()),
                },
            });
        }
        results
    }

    // ========================================================================
    // Enrichment
    // ========================================================================

    /// Installs with best-effort live information, newest first.
    pub async fn list_installs_enriched(&self) -> Vec<InstallDetail> {
        let installs = self.inner.store.installs();
        join_all(installs.into_iter().map(|i| self.inner.enrich_install(i))).await
    }

    /// Stacks with best-effort live information, newest first.
    pub async fn list_stacks_enriched(&self) -> Vec<StackDetail> {
        let stacks = self.inner.store.stacks();
        join_all(stacks.into_iter().map(|s| self.inner.enrich_stack(s))).await
    }
}
