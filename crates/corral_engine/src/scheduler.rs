use crate::{guard::GuardPermit, logs::LogStore, pipeline::Step};
use corral_core::prelude::*;

use chrono::Utc;
use futures::FutureExt;
use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// How a job's work ended, short of success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The cancellation token fired. The job ends `cancelled`.
    #[error("{}", messages::CANCELLED_BY_USER)]
    Cancelled,

    /// The job ends `failed` with this message.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<RuntimeError> for JobError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Cancelled => JobError::Cancelled,
            other => JobError::Failed(other.to_string()),
        }
    }
}

impl From<EngineError> for JobError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Runtime(RuntimeError::Cancelled) => JobError::Cancelled,
            other => JobError::Failed(other.to_string()),
        }
    }
}

impl From<StorageError> for JobError {
    fn from(e: StorageError) -> Self {
        JobError::Failed(e.to_string())
    }
}

pub trait JobResultExt<T> {
    /// Prefixes a failure with what was being attempted. Cancellation passes through unchanged.
    fn context(self, what: impl fmt::Display) -> Result<T, JobError>;
}

impl<T, E: Into<JobError>> JobResultExt<T> for Result<T, E> {
    fn context(self, what: impl fmt::Display) -> Result<T, JobError> {
        self.map_err(|e| match e.into() {
            JobError::Failed(msg) => JobError::Failed(format!("{what}: {msg}")),
            cancelled => cancelled,
        })
    }
}

/// Tracks every job, runs their workers under a global concurrency cap
/// and owns their cancellation tokens and logs.
pub struct JobScheduler<B> {
    jobs: RwLock<HashMap<String, Job>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    logs: LogStore<B>,
    slots: Arc<Semaphore>,
    finished: Notify,
    backend: B,
}

impl<B: StateBackend> JobScheduler<B> {
    pub fn new(backend: B, max_concurrent_jobs: usize) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            logs: LogStore::new(backend.clone()),
            slots: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            finished: Notify::new(),
            backend,
        })
    }

    /// Loads persisted jobs and logs. Jobs that were still queued or running are
    /// failed as interrupted and returned.
    pub async fn restore(&self, jobs: Vec<Job>, logs: HashMap<String, Vec<LogEntry>>) -> Vec<Job> {
        self.logs.restore(logs);
        let mut interrupted = Vec::new();
        for mut job in jobs {
            if !job.is_terminal() {
                job.advance(
                    JobState::Failed,
                    Some(messages::INTERRUPTED_BY_RESTART.to_string()),
                );
                self.logs
                    .append(
                        &job.id,
                        LogLevel::Error,
                        format!("Job {}", messages::INTERRUPTED_BY_RESTART),
                    )
                    .await;
                self.persist(&job).await;
                tracing::warn!("Job {} ({}) was interrupted by a restart", job.id, job.kind);
                interrupted.push(job.clone());
            }
            self.jobs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(job.id.clone(), job);
        }
        interrupted
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.backend.write_job(job).await {
            tracing::error!("Failed to persist job {}: {e}", job.id);
        }
    }

    /// Registers a new `queued` job.
    pub async fn submit(&self, job: Job) -> Result<Job> {
        self.backend.write_job(&job).await?;
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), CancellationToken::new());
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), job.clone());
        tracing::info!("Job {} ({} {}) queued", job.id, job.kind, job.target);
        Ok(job)
    }

    fn token(&self, job_id: &str) -> CancellationToken {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    /// Mutates a job record and writes it through.
    pub(crate) async fn update(&self, job_id: &str, f: impl FnOnce(&mut Job)) -> Option<Job> {
        let job = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let job = jobs.get_mut(job_id)?;
            f(job);
            job.updated_at = Utc::now();
            job.clone()
        };
        self.persist(&job).await;
        Some(job)
    }

    async fn transition(&self, job_id: &str, next: JobState, error: Option<String>) -> Option<Job> {
        let job = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let job = jobs.get_mut(job_id)?;
            if !job.advance(next, error) {
                return None;
            }
            job.clone()
        };
        self.persist(&job).await;
        tracing::info!("Job {} ({} {}) {}", job.id, job.kind, job.target, job.state);
        Some(job)
    }

    /// Spawns the worker of a submitted job.
    ///
    /// The job stays `queued` until a slot is free and can be cancelled while it waits.
    /// `permit` is released once the terminal state is recorded, before waiters are woken.
    pub fn launch<F, Fut>(self: &Arc<Self>, job_id: &str, permit: GuardPermit, work: F)
    where
        F: FnOnce(JobContext<B>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let scheduler = self.clone();
        let job_id = job_id.to_string();
        let cancel = self.token(&job_id);

        tokio::spawn(async move {
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                slot = scheduler.slots.clone().acquire_owned() => slot.ok(),
            };
            let result = match slot {
                None => Err(JobError::Cancelled),
                Some(_slot) => {
                    scheduler.transition(&job_id, JobState::Running, None).await;
                    let ctx = JobContext {
                        scheduler: scheduler.clone(),
                        job_id: job_id.clone(),
                        cancel,
                    };
                    AssertUnwindSafe(work(ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(JobError::failed("worker panicked")))
                }
            };
            scheduler.finish(&job_id, result, permit).await;
        });
    }

    async fn finish(&self, job_id: &str, result: Result<(), JobError>, permit: GuardPermit) {
        let step = self.get(job_id).and_then(|j| j.step);
        let (state, error) = match result {
            Ok(()) => (JobState::Completed, None),
            Err(JobError::Cancelled) => {
                let msg = match &step {
                    Some(step) => format!("Job cancelled by user during {step}"),
                    None => "Job cancelled by user".to_string(),
                };
                self.logs.append(job_id, LogLevel::Warn, msg).await;
                (JobState::Cancelled, None)
            }
            Err(JobError::Failed(msg)) => {
                let error = match &step {
                    Some(step) => {
                        self.logs
                            .append(job_id, LogLevel::Error, format!("Failed at {step}: {msg}"))
                            .await;
                        format!("{step}: {msg}")
                    }
                    None => {
                        self.logs
                            .append(job_id, LogLevel::Error, format!("Failed: {msg}"))
                            .await;
                        msg
                    }
                };
                (JobState::Failed, Some(error))
            }
        };

        // Whoever finds the target free must also find the job terminal.
        self.transition(job_id, state, error).await;
        drop(permit);
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        self.finished.notify_waiters();
    }

    /// Requests cancellation. Workers observe it at their next checkpoint.
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let job = self
            .get(job_id)
            .ok_or_else(|| EngineError::not_found("job", job_id))?;
        if job.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "job {job_id} is already {}",
                job.state
            )));
        }
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
            self.logs
                .append(job_id, LogLevel::Warn, "Cancellation requested")
                .await;
            tracing::info!("Cancellation requested for job {job_id}");
        }
        Ok(job)
    }

    /// Resolves once the job is terminal.
    pub async fn wait(&self, job_id: &str) -> Result<Job> {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self
                .get(job_id)
                .ok_or_else(|| EngineError::not_found("job", job_id))?;
            if job.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// A queued or running non-stack job targeting `app_id`.
    pub fn active_for_app(&self, app_id: &str) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|j| !j.is_terminal() && !j.kind.is_stack() && j.target == app_id)
            .cloned()
    }

    /// Deletes terminal jobs and their logs. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let removed: Vec<String> = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = jobs
                .values()
                .filter(|j| j.is_terminal())
                .map(|j| j.id.clone())
                .collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };
        for id in &removed {
            self.logs.remove(id);
            if let Err(e) = self.backend.delete_job(id).await {
                tracing::warn!("Failed to delete job {id}: {e}");
            }
        }
        removed.len()
    }

    pub async fn logs_since(&self, job_id: &str, after_id: u64) -> (Vec<LogEntry>, u64) {
        self.logs.since(job_id, after_id).await
    }

    pub async fn logs(&self, job_id: &str) -> Vec<LogEntry> {
        self.logs.all(job_id).await
    }

    pub(crate) async fn log(&self, job_id: &str, level: LogLevel, message: impl Into<String>) {
        self.logs.append(job_id, level, message).await;
    }
}

/// A running job's handle to its own record, log and cancellation token.
pub struct JobContext<B> {
    scheduler: Arc<JobScheduler<B>>,
    job_id: String,
    cancel: CancellationToken,
}

impl<B: StateBackend> JobContext<B> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.scheduler.log(&self.job_id, LogLevel::Info, message).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.scheduler.log(&self.job_id, LogLevel::Warn, message).await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.scheduler.log(&self.job_id, level, message).await;
    }

    /// Checkpoint between steps: stops on cancellation, otherwise records `step` as current.
    pub async fn enter(&self, step: Step) -> Result<(), JobError> {
        self.check()?;
        self.scheduler
            .update(&self.job_id, |job| job.step = Some(step.to_string()))
            .await;
        self.info(format!("Step: {step}")).await;
        Ok(())
    }

    pub async fn set_ctid(&self, ctid: u32) {
        self.scheduler
            .update(&self.job_id, |job| job.ctid = Some(ctid))
            .await;
    }

    pub async fn set_install(&self, install_id: &str) {
        self.scheduler
            .update(&self.job_id, |job| job.install_id = Some(install_id.to_string()))
            .await;
    }

    pub async fn set_stack(&self, stack_id: &str) {
        self.scheduler
            .update(&self.job_id, |job| job.stack_id = Some(stack_id.to_string()))
            .await;
    }

    pub fn job(&self) -> Option<Job> {
        self.scheduler.get(&self.job_id)
    }
}
